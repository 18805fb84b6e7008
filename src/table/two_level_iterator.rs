use crate::{error::Result, iterator::Iterator};

/// Constructs the data iterator for an index entry's value (an encoded
/// block handle).
pub(crate) type BlockFunction = Box<dyn FnMut(&[u8]) -> Box<dyn Iterator>>;

/// Chains an index-block iterator with lazily opened data-block iterators:
/// the outer level walks `(separator, handle)` pairs, the inner level the
/// entries of the currently selected block.
pub struct TwoLevelIterator {
    index_iter: Box<dyn Iterator>,
    block_function: BlockFunction,

    data_iter: Option<Box<dyn Iterator>>,
    // Index value the current data_iter was built from.
    data_block_handle: Vec<u8>,

    status: Option<crate::error::Error>,
}

impl TwoLevelIterator {
    pub(crate) fn new(index_iter: Box<dyn Iterator>, block_function: BlockFunction) -> Self {
        Self {
            index_iter,
            block_function,
            data_iter: None,
            data_block_handle: Vec::new(),
            status: None,
        }
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.is_valid())
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.is_valid() {
            self.set_data_iterator(None);
            return;
        }
        let handle = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && handle == self.data_block_handle {
            // Still over the same block; keep the position machinery warm.
            return;
        }
        let data_iter = (self.block_function)(&handle);
        self.data_block_handle = handle;
        self.set_data_iterator(Some(data_iter));
    }

    fn set_data_iterator(&mut self, data_iter: Option<Box<dyn Iterator>>) {
        // Don't lose an error latched by the iterator being replaced.
        if let Some(old) = &mut self.data_iter {
            if self.status.is_none() {
                if let Err(e) = old.status() {
                    self.status = Some(e);
                }
            }
        }
        self.data_iter = data_iter;
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.is_valid() {
                self.set_data_iterator(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.is_valid() {
                self.set_data_iterator(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }
}

impl Iterator for TwoLevelIterator {
    fn is_valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        assert!(self.is_valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        assert!(self.is_valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        assert!(self.is_valid());
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid());
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&mut self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.status()?;
        }
        match self.status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
