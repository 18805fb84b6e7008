//! Sharded LRU cache with an explicit handle-based reference protocol.
//!
//! Every entry carries a reference count. While `in_cache` is set the cache
//! itself contributes one reference; every handle given to a caller
//! contributes another. An entry is destroyed (deleter invoked, storage
//! freed) when the count reaches zero, which may be long after it fell out
//! of the cache.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::util::hash::hash;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// Called with the key and value when an entry is destroyed. Different
/// block kinds hang their cleanup off this.
pub type Deleter<V> = Box<dyn FnMut(&[u8], &mut V) + Send>;

struct LruHandle<V> {
    value: Option<V>,
    deleter: Option<Deleter<V>>,
    next_hash: *mut LruHandle<V>,
    next: *mut LruHandle<V>,
    prev: *mut LruHandle<V>,
    charge: usize,
    key: Box<[u8]>,
    hash: u32,
    /// Whether the cache still holds its reference.
    in_cache: bool,
    refs: u32,
}

/// An opaque reference to a live cache entry. Must be given back via
/// [`ShardedLruCache::release`]; the entry cannot be destroyed while the
/// handle is outstanding.
pub struct Handle<V> {
    ptr: *mut LruHandle<V>,
}

unsafe impl<V: Send> Send for Handle<V> {}

/// Chained hash table sized so the average bucket holds at most one entry.
struct HandleTable<V> {
    list: Vec<*mut LruHandle<V>>,
    elems: usize,
}

impl<V> HandleTable<V> {
    fn new() -> Self {
        let mut this = Self {
            list: Vec::new(),
            elems: 0,
        };
        this.resize();
        this
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<V> {
        unsafe { *self.find_pointer(key, hash) }
    }

    /// Links `h` in, returning the displaced entry with the same key if any.
    fn insert(&mut self, h: *mut LruHandle<V>) -> *mut LruHandle<V> {
        unsafe {
            let ptr = self.find_pointer(&(*h).key, (*h).hash);
            let old = *ptr;
            (*h).next_hash = if old.is_null() { std::ptr::null_mut() } else { (*old).next_hash };
            *ptr = h;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.list.len() {
                    self.resize();
                }
            }
            old
        }
    }

    fn remove(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<V> {
        unsafe {
            let ptr = self.find_pointer(key, hash);
            let result = *ptr;
            if !result.is_null() {
                *ptr = (*result).next_hash;
                self.elems -= 1;
            }
            result
        }
    }

    /// Slot holding the matching entry, or the trailing null slot of its
    /// bucket chain.
    fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut LruHandle<V> {
        unsafe {
            let mask = self.list.len() - 1;
            let mut ptr: *mut *mut LruHandle<V> = &mut self.list[hash as usize & mask];
            while !(*ptr).is_null() && ((**ptr).hash != hash || &*(**ptr).key != key) {
                ptr = &mut (**ptr).next_hash;
            }
            ptr
        }
    }

    fn resize(&mut self) {
        let mut new_length = 4;
        while new_length < self.elems {
            new_length *= 2;
        }
        let mut new_list: Vec<*mut LruHandle<V>> = vec![std::ptr::null_mut(); new_length];
        let mut count = 0;
        for i in 0..self.list.len() {
            let mut h = self.list[i];
            while !h.is_null() {
                unsafe {
                    let next = (*h).next_hash;
                    let slot = &mut new_list[(*h).hash as usize & (new_length - 1)];
                    (*h).next_hash = *slot;
                    *slot = h;
                    h = next;
                }
                count += 1;
            }
        }
        assert_eq!(self.elems, count);
        self.list = new_list;
    }
}

/// One shard: a capacity, a usage counter, a circular LRU list behind a
/// head sentinel (`prev` of the sentinel is the MRU end, `next` the LRU
/// end), and the hash table.
struct LruShard<V> {
    capacity: usize,
    usage: usize,
    lru: *mut LruHandle<V>,
    table: HandleTable<V>,
}

unsafe impl<V: Send> Send for LruShard<V> {}

impl<V> LruShard<V> {
    fn new(capacity: usize) -> Self {
        let sentinel = Box::into_raw(Box::new(LruHandle {
            value: None,
            deleter: None,
            next_hash: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            prev: std::ptr::null_mut(),
            charge: 0,
            key: Vec::new().into_boxed_slice(),
            hash: 0,
            in_cache: false,
            refs: 0,
        }));
        unsafe {
            (*sentinel).next = sentinel;
            (*sentinel).prev = sentinel;
        }
        Self {
            capacity,
            usage: 0,
            lru: sentinel,
            table: HandleTable::new(),
        }
    }

    fn insert(
        &mut self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> Handle<V> {
        let e = Box::into_raw(Box::new(LruHandle {
            value: Some(value),
            deleter,
            next_hash: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            prev: std::ptr::null_mut(),
            charge,
            key: Box::from(key),
            hash,
            in_cache: true,
            // One reference for the cache, one for the returned handle.
            refs: 2,
        }));

        unsafe {
            self.lru_append(e);
            self.usage += charge;

            let old = self.table.insert(e);
            if !old.is_null() {
                self.lru_remove(old);
                (*old).in_cache = false;
                self.unref(old);
            }

            while self.usage > self.capacity && (*self.lru).next != self.lru {
                let oldest = (*self.lru).next;
                let key = (*oldest).key.clone();
                self.lru_remove(oldest);
                self.table.remove(&key, (*oldest).hash);
                (*oldest).in_cache = false;
                self.unref(oldest);
            }
        }

        Handle { ptr: e }
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> Option<Handle<V>> {
        let e = self.table.lookup(key, hash);
        if e.is_null() {
            return None;
        }
        unsafe {
            (*e).refs += 1;
            self.lru_remove(e);
            self.lru_append(e);
        }
        Some(Handle { ptr: e })
    }

    fn release(&mut self, handle: Handle<V>) {
        unsafe { self.unref(handle.ptr) }
    }

    fn erase(&mut self, key: &[u8], hash: u32) {
        let e = self.table.remove(key, hash);
        if !e.is_null() {
            unsafe {
                self.lru_remove(e);
                (*e).in_cache = false;
                self.unref(e);
            }
        }
    }

    unsafe fn unref(&mut self, e: *mut LruHandle<V>) {
        assert!((*e).refs > 0);
        (*e).refs -= 1;
        if (*e).refs == 0 {
            assert!(!(*e).in_cache);
            self.usage -= (*e).charge;
            let mut entry = Box::from_raw(e);
            if let (Some(mut deleter), Some(value)) = (entry.deleter.take(), entry.value.as_mut()) {
                deleter(&entry.key, value);
            }
        }
    }

    unsafe fn lru_remove(&mut self, e: *mut LruHandle<V>) {
        (*(*e).next).prev = (*e).prev;
        (*(*e).prev).next = (*e).next;
    }

    /// Links `e` in at the MRU end (just before the sentinel).
    unsafe fn lru_append(&mut self, e: *mut LruHandle<V>) {
        (*e).next = self.lru;
        (*e).prev = (*self.lru).prev;
        (*(*e).prev).next = e;
        (*(*e).next).prev = e;
    }
}

impl<V> Drop for LruShard<V> {
    fn drop(&mut self) {
        unsafe {
            let mut e = (*self.lru).next;
            while e != self.lru {
                let next = (*e).next;
                // A higher count means a caller leaked a handle.
                assert_eq!((*e).refs, 1, "cache dropped with an unreleased handle");
                (*e).in_cache = false;
                self.unref(e);
                e = next;
            }
            drop(Box::from_raw(self.lru));
        }
    }
}

/// Capacity split over 16 independently locked shards; the top hash bits
/// pick the shard.
pub struct ShardedLruCache<V> {
    shards: Vec<Mutex<LruShard<V>>>,
    last_id: AtomicU64,
}

unsafe impl<V: Send> Send for ShardedLruCache<V> {}
unsafe impl<V: Send> Sync for ShardedLruCache<V> {}

impl<V> ShardedLruCache<V> {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(LruShard::new(per_shard)))
                .collect(),
            last_id: AtomicU64::new(0),
        }
    }

    pub fn insert(
        &self,
        key: &[u8],
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> Handle<V> {
        let hash = Self::hash_key(key);
        self.shard(hash).lock().insert(key, hash, value, charge, deleter)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Handle<V>> {
        let hash = Self::hash_key(key);
        self.shard(hash).lock().lookup(key, hash)
    }

    pub fn release(&self, handle: Handle<V>) {
        let hash = unsafe { (*handle.ptr).hash };
        self.shard(hash).lock().release(handle)
    }

    pub fn erase(&self, key: &[u8]) {
        let hash = Self::hash_key(key);
        self.shard(hash).lock().erase(key, hash)
    }

    /// The value behind a handle. Valid until the handle is released.
    pub fn value<'a>(&self, handle: &'a Handle<V>) -> &'a V {
        unsafe { (*handle.ptr).value.as_ref().unwrap() }
    }

    /// A fresh id, used to partition a shared cache between clients.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().usage).sum()
    }

    fn shard(&self, hash: u32) -> &Mutex<LruShard<V>> {
        &self.shards[(hash >> (32 - NUM_SHARD_BITS)) as usize]
    }

    fn hash_key(key: &[u8]) -> u32 {
        hash(key, 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::{Handle, LruShard, ShardedLruCache};

    fn encode_key(k: u32) -> Vec<u8> {
        k.to_le_bytes().to_vec()
    }

    struct ShardFixture {
        shard: LruShard<u32>,
        evicted: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl ShardFixture {
        fn new(capacity: usize) -> Self {
            Self {
                shard: LruShard::new(capacity),
                evicted: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn insert(&mut self, key: u32, value: u32) -> Handle<u32> {
            let evicted = self.evicted.clone();
            self.shard.insert(
                &encode_key(key),
                key, // shard is hash-agnostic; use the key itself
                value,
                1,
                Some(Box::new(move |k, v| {
                    let k = u32::from_le_bytes(k.try_into().unwrap());
                    evicted.lock().unwrap().push((k, *v));
                })),
            )
        }

        fn get(&mut self, key: u32) -> Option<u32> {
            let handle = self.shard.lookup(&encode_key(key), key)?;
            let value = unsafe { (*handle.ptr).value.unwrap() };
            self.shard.release(handle);
            Some(value)
        }
    }

    #[test]
    fn hit_and_miss() {
        let mut f = ShardFixture::new(100);
        assert_eq!(f.get(100), None);

        let h = f.insert(100, 101);
        f.shard.release(h);
        assert_eq!(f.get(100), Some(101));
        assert_eq!(f.get(200), None);
        assert_eq!(f.get(300), None);

        let h = f.insert(200, 201);
        f.shard.release(h);
        assert_eq!(f.get(100), Some(101));
        assert_eq!(f.get(200), Some(201));

        // Duplicate key displaces the old entry and frees it.
        let h = f.insert(100, 102);
        f.shard.release(h);
        assert_eq!(f.get(100), Some(102));
        assert_eq!(f.evicted.lock().unwrap().as_slice(), &[(100, 101)]);
    }

    #[test]
    fn erase() {
        let mut f = ShardFixture::new(100);
        f.shard.erase(&encode_key(200), 200);
        assert!(f.evicted.lock().unwrap().is_empty());

        let h = f.insert(100, 101);
        f.shard.release(h);
        let h = f.insert(200, 201);
        f.shard.release(h);
        f.shard.erase(&encode_key(100), 100);
        assert_eq!(f.get(100), None);
        assert_eq!(f.get(200), Some(201));
        assert_eq!(f.evicted.lock().unwrap().as_slice(), &[(100, 101)]);

        // Erasing again is a no-op.
        f.shard.erase(&encode_key(100), 100);
        assert_eq!(f.evicted.lock().unwrap().len(), 1);
    }

    #[test]
    fn entries_are_pinned_by_handles() {
        let mut f = ShardFixture::new(100);
        let h1 = f.insert(100, 101);
        let h2 = f.insert(100, 102); // displaces, but h1 still pins 101
        assert_eq!(f.get(100), Some(102));
        assert!(f.evicted.lock().unwrap().is_empty());

        f.shard.release(h1);
        assert_eq!(f.evicted.lock().unwrap().as_slice(), &[(100, 101)]);

        f.shard.erase(&encode_key(100), 100);
        assert_eq!(f.get(100), None);
        assert_eq!(f.evicted.lock().unwrap().len(), 1);

        f.shard.release(h2);
        assert_eq!(f.evicted.lock().unwrap().as_slice(), &[(100, 101), (100, 102)]);
    }

    #[test]
    fn eviction_policy_keeps_recently_used() {
        // Capacity pressure: after n inserts of charge 1 into a shard of
        // capacity c, exactly n - c deleters have run and the c most
        // recently used keys survive.
        const CAPACITY: usize = 100;
        const EXTRA: usize = 120;

        let mut f = ShardFixture::new(CAPACITY);
        for i in 0..(CAPACITY + EXTRA) as u32 {
            let h = f.insert(1000 + i, 2000 + i);
            f.shard.release(h);
            // Keep key 1000 warm.
            assert_eq!(f.get(1000), Some(2000));
        }

        assert_eq!(f.evicted.lock().unwrap().len(), EXTRA);
        assert_eq!(f.shard.usage, CAPACITY);
        assert_eq!(f.get(1000), Some(2000));
        for i in (CAPACITY + EXTRA - (CAPACITY - 1))..(CAPACITY + EXTRA) {
            assert_eq!(
                f.get(1000 + i as u32),
                Some(2000 + i as u32),
                "recent key {i} must survive"
            );
        }
        for (k, _) in f.evicted.lock().unwrap().iter() {
            assert_ne!(*k, 1000, "warm key must never be evicted");
        }
    }

    #[test]
    fn heavy_entries_evict_by_charge() {
        const LIGHT: usize = 1;
        const HEAVY: usize = 10;
        const CAPACITY: usize = 100;

        let mut shard: LruShard<usize> = LruShard::new(CAPACITY);
        let mut added = 0;
        let mut index = 0u32;
        while added < 2 * CAPACITY {
            let weight = if index & 1 == 1 { LIGHT } else { HEAVY };
            let h = shard.insert(&encode_key(index), index, weight, weight, None);
            shard.release(h);
            added += weight;
            index += 1;
        }
        assert!(shard.usage <= CAPACITY, "usage {} over capacity", shard.usage);
    }

    #[test]
    fn sharded_cache_end_to_end() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);

        let cache: ShardedLruCache<String> = ShardedLruCache::new(1 << 20);
        let h = cache.insert(
            b"a",
            "alpha".to_string(),
            5,
            Some(Box::new(|_, _| {
                DELETED.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(cache.value(&h), "alpha");
        cache.release(h);

        let h = cache.lookup(b"a").expect("cached");
        assert_eq!(cache.value(&h), "alpha");
        cache.release(h);
        assert_eq!(cache.total_charge(), 5);

        assert!(cache.lookup(b"missing").is_none());
        cache.erase(b"a");
        assert!(cache.lookup(b"a").is_none());
        assert_eq!(DELETED.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn new_ids_are_unique() {
        let cache: ShardedLruCache<u32> = ShardedLruCache::new(16);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn table_resize_preserves_entries() {
        let mut shard: LruShard<u32> = LruShard::new(1 << 20);
        // Push far past the initial table length to force several resizes.
        for i in 0..1000u32 {
            let h = shard.insert(&encode_key(i), i, i, 1, None);
            shard.release(h);
        }
        for i in 0..1000u32 {
            let h = shard.lookup(&encode_key(i), i).expect("resized away");
            shard.release(h);
        }
    }
}
