use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};

const BLOCK_SIZE: usize = 4096;

/// Bump allocator over a chain of heap blocks.
///
/// Everything allocated from an arena is freed together when the arena is
/// dropped. The arena is not internally synchronized: only one thread may
/// allocate at a time (the memtable's single writer). Readers never touch
/// the arena directly; they follow pointers the writer published through
/// the skip list, so concurrent reads of already-published bytes are safe.
pub struct Arena {
    inner: UnsafeCell<Inner>,
    memory_usage: AtomicUsize,
}

struct Inner {
    // Bump state for the current block.
    ptr: *mut u8,
    bytes_remaining: usize,
    blocks: Vec<Vec<u8>>,
}

// Single-writer contract above; published allocations are immutable.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                ptr: std::ptr::null_mut(),
                bytes_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns a pointer to `bytes` fresh bytes. `bytes` must be non-zero.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let inner = unsafe { &mut *self.inner.get() };
        if bytes <= inner.bytes_remaining {
            let result = inner.ptr;
            inner.ptr = unsafe { inner.ptr.add(bytes) };
            inner.bytes_remaining -= bytes;
            return result;
        }
        self.allocate_fallback(inner, bytes)
    }

    /// Like [`allocate`](Self::allocate) but the result is aligned for
    /// pointer-sized data.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        const ALIGN: usize = if std::mem::size_of::<usize>() > 8 {
            std::mem::size_of::<usize>()
        } else {
            8
        };

        let inner = unsafe { &mut *self.inner.get() };
        let slop = {
            let current_mod = inner.ptr as usize & (ALIGN - 1);
            if current_mod == 0 {
                0
            } else {
                ALIGN - current_mod
            }
        };
        let needed = bytes + slop;
        if needed <= inner.bytes_remaining {
            let result = unsafe { inner.ptr.add(slop) };
            inner.ptr = unsafe { inner.ptr.add(needed) };
            inner.bytes_remaining -= needed;
            return result;
        }
        // Fallback blocks come straight from the heap and are aligned well
        // past ALIGN already.
        self.allocate_fallback(inner, bytes)
    }

    /// Bytes held by all blocks plus the block bookkeeping itself.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Acquire)
    }

    fn allocate_fallback(&self, inner: &mut Inner, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Large object: dedicated block, keep bumping in the current one.
            return self.allocate_new_block(inner, bytes);
        }

        // Retire the current block, wasting its tail.
        let ptr = self.allocate_new_block(inner, BLOCK_SIZE);
        inner.ptr = unsafe { ptr.add(bytes) };
        inner.bytes_remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn allocate_new_block(&self, inner: &mut Inner, block_bytes: usize) -> *mut u8 {
        let mut block = vec![0u8; block_bytes];
        let ptr = block.as_mut_ptr();
        inner.blocks.push(block);
        self.memory_usage.store(
            inner.blocks.iter().map(Vec::len).sum::<usize>()
                + inner.blocks.capacity() * std::mem::size_of::<Vec<u8>>(),
            Ordering::Release,
        );
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::{Arena, BLOCK_SIZE};

    #[test]
    fn empty_arena() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn bump_within_block() {
        let arena = Arena::new();
        let a = arena.allocate(16);
        let b = arena.allocate(16);
        assert_eq!(unsafe { a.add(16) }, b);
        assert!(arena.memory_usage() >= BLOCK_SIZE);
    }

    #[test]
    fn large_requests_get_dedicated_blocks() {
        let arena = Arena::new();
        let a = arena.allocate(8);
        // Larger than a quarter block: must not clobber the bump pointer.
        arena.allocate(BLOCK_SIZE);
        let b = arena.allocate(8);
        assert_eq!(unsafe { a.add(8) }, b);
    }

    #[test]
    fn aligned_allocations() {
        let arena = Arena::new();
        arena.allocate(1);
        for _ in 0..100 {
            let p = arena.allocate_aligned(9);
            assert_eq!(p as usize % 8, 0);
        }
    }

    #[test]
    fn random_usage_accounting() {
        const N: usize = 2000;

        let mut rng = rand::thread_rng();
        let arena = Arena::new();
        let mut allocated = 0;
        let mut ptrs = Vec::new();

        for i in 0..N {
            let size = if i % 23 == 0 {
                rng.gen_range(1..=BLOCK_SIZE * 3)
            } else {
                rng.gen_range(1..=32)
            };
            let p = arena.allocate(size);
            // Scribble a pattern so overlapping allocations would show up.
            for j in 0..size {
                unsafe { p.add(j).write((i % 256) as u8) };
            }
            allocated += size;
            ptrs.push((p, size, (i % 256) as u8));
            assert!(arena.memory_usage() >= allocated);
        }

        for (p, size, fill) in ptrs {
            for j in 0..size {
                assert_eq!(unsafe { p.add(j).read() }, fill);
            }
        }
    }
}
