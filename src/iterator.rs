use crate::error::Result;

/// Cursor-style iteration shared by blocks, tables and the memtable.
///
/// `key`/`value` may only be called while `is_valid()`; a decode failure
/// invalidates the iterator and is surfaced through `status()`.
pub trait Iterator {
    fn is_valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Position at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    fn status(&mut self) -> Result<()>;
}

/// An iterator over nothing, optionally carrying an error.
pub struct EmptyIterator {
    status: Option<crate::error::Error>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self { status: None }
    }

    pub fn with_error(err: crate::error::Error) -> Self {
        Self { status: Some(err) }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for EmptyIterator {
    fn is_valid(&self) -> bool {
        false
    }

    fn seek_to_first(&mut self) {}

    fn seek_to_last(&mut self) {}

    fn seek(&mut self, _target: &[u8]) {}

    fn next(&mut self) {
        unreachable!("next on an empty iterator");
    }

    fn prev(&mut self) {
        unreachable!("prev on an empty iterator");
    }

    fn key(&self) -> &[u8] {
        unreachable!("key on an empty iterator");
    }

    fn value(&self) -> &[u8] {
        unreachable!("value on an empty iterator");
    }

    fn status(&mut self) -> Result<()> {
        match self.status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
