use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::epoch::{EpochDomain, Reclaim};
use crate::heap::{GlobalHeap, Heap, Result};
use crate::key::{encode, TrieKey};
use crate::slot::Slot;

mod builder;
mod check;
mod erase;
mod insert;
mod navigate;
pub mod node;
mod tests;

//-------------------------------------------------------------------------

/// The engine shared by both map flavours: root slot, live-pair count,
/// writer mutex, allocator, and the reclamation mode.
pub(crate) struct Core<V> {
    root: Slot,
    count: AtomicUsize,
    writer: Mutex<()>,
    heap: Arc<dyn Heap>,
    reclaim: Reclaim,
    phantom: PhantomData<V>,
}

impl<V> Core<V> {
    fn new(heap: Arc<dyn Heap>, reclaim: Reclaim) -> Self {
        Self {
            root: Slot::null(),
            count: AtomicUsize::new(0),
            writer: Mutex::new(()),
            heap,
            reclaim,
            phantom: PhantomData,
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl<V: Clone> Core<V> {
    fn get(&self, key: &[u8]) -> Option<V> {
        let _pin = self.reclaim.pin();
        navigate::lookup::<V>(&self.root, key)
    }

    fn has(&self, key: &[u8]) -> bool {
        let _pin = self.reclaim.pin();
        navigate::contains::<V>(&self.root, key)
    }

    fn first(&self) -> Option<(Vec<u8>, V)> {
        let _pin = self.reclaim.pin();
        navigate::first_pair::<V>(&self.root)
    }

    fn clear(&self) {
        let _lock = self.writer.lock().unwrap();
        let w = self.root.load();
        if w == 0 {
            return;
        }
        self.root.store_sentinel();
        self.root.store(0);
        self.count.store(0, Ordering::Relaxed);
        unsafe {
            self.reclaim
                .defer(w as *mut u8, builder::free_subtree_erased::<V>, &self.heap)
        };
    }

    /// Deep copy under the source's writer lock; the copy starts life
    /// with the same heap and reclamation mode.
    fn deep_clone(&self, reclaim: Reclaim) -> Result<Self> {
        let _lock = self.writer.lock().unwrap();
        let w = self.root.load();
        let root = if w == 0 {
            Slot::null()
        } else {
            Slot::new(builder::deep_copy::<V>(self.heap.as_ref(), w)?)
        };
        Ok(Self {
            root,
            count: AtomicUsize::new(self.count.load(Ordering::Relaxed)),
            writer: Mutex::new(()),
            heap: self.heap.clone(),
            reclaim,
            phantom: PhantomData,
        })
    }

    fn swap_with(&mut self, other: &mut Core<V>) {
        // Exclusive borrows rule out concurrent readers and writers, so
        // plain load/store pairs are enough.
        let a = self.root.load();
        let b = other.root.load();
        self.root.store(b);
        other.root.store(a);

        let ca = self.count.load(Ordering::Relaxed);
        let cb = other.count.load(Ordering::Relaxed);
        self.count.store(cb, Ordering::Relaxed);
        other.count.store(ca, Ordering::Relaxed);

        std::mem::swap(&mut self.heap, &mut other.heap);
        std::mem::swap(&mut self.reclaim, &mut other.reclaim);
    }
}

impl<V> Drop for Core<V> {
    fn drop(&mut self) {
        let w = self.root.load();
        if w != 0 {
            // Exclusive access: every reader and retired-node grace
            // period for this tree has drained.
            unsafe {
                builder::free_subtree::<V>(self.heap.as_ref(), w as *mut node::Node<V>);
            }
        }
    }
}

//-------------------------------------------------------------------------

/// Snapshot iterator: the key bytes and a copy of the value, captured at
/// the moment find/begin/insert returned.  Ordered iteration over a
/// concurrently mutating trie is out of scope, so advancing an entry
/// always yields end.
pub struct Entry<K, V> {
    bytes: Vec<u8>,
    value: V,
    phantom: PhantomData<K>,
}

impl<K: TrieKey, V> Entry<K, V> {
    fn new(bytes: Vec<u8>, value: V) -> Self {
        Self {
            bytes,
            value,
            phantom: PhantomData,
        }
    }

    pub fn key(&self) -> K {
        K::from_bytes(&self.bytes)
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    /// Always end.
    pub fn next(self) -> Option<Entry<K, V>> {
        None
    }
}

//-------------------------------------------------------------------------

/// Single-threaded trie map.  Mutation takes &mut self; replaced nodes
/// are freed on the spot instead of going through epoch reclamation.
pub struct Trie<K: TrieKey, V: Clone> {
    core: Core<V>,
    phantom: PhantomData<K>,
}

impl<K: TrieKey, V: Clone> Trie<K, V> {
    pub fn new() -> Self {
        Self::with_heap(Arc::new(GlobalHeap))
    }

    pub fn with_heap(heap: Arc<dyn Heap>) -> Self {
        Self {
            core: Core::new(heap, Reclaim::Direct),
            phantom: PhantomData,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.core.has(&encode(key))
    }

    pub fn find(&self, key: &K) -> Option<Entry<K, V>> {
        let bytes = encode(key);
        self.core.get(&bytes).map(|v| Entry::new(bytes, v))
    }

    pub fn insert(&mut self, key: &K, value: V) -> Result<(Entry<K, V>, bool)> {
        let bytes = encode(key);
        let (v, inserted) = self.core.insert_bytes(&bytes, value)?;
        Ok((Entry::new(bytes, v), inserted))
    }

    pub fn erase(&mut self, key: &K) -> Result<bool> {
        self.core.erase_bytes(&encode(key))
    }

    pub fn clear(&mut self) {
        self.core.clear();
    }

    pub fn size(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn begin(&self) -> Option<Entry<K, V>> {
        self.core.first().map(|(bytes, v)| Entry::new(bytes, v))
    }

    pub fn swap(&mut self, other: &mut Self) {
        self.core.swap_with(&mut other.core);
    }

    /// Walk the whole tree verifying the structural invariants; returns
    /// the number of live pairs.
    pub fn check(&self) -> anyhow::Result<u64> {
        self.core.check()
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            core: self.core.deep_clone(Reclaim::Direct)?,
            phantom: PhantomData,
        })
    }
}

impl<K: TrieKey, V: Clone> Default for Trie<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TrieKey, V: Clone> Clone for Trie<K, V> {
    fn clone(&self) -> Self {
        self.try_clone().expect("trie clone: allocation failed")
    }
}

//-------------------------------------------------------------------------

/// Single-writer / many-reader trie map.  Readers are lock-free on the
/// happy path; writers serialize on an internal mutex and retire replaced
/// nodes through the process-wide epoch domain.
pub struct ConcurrentTrie<K: TrieKey, V: Clone + Send + Sync> {
    core: Core<V>,
    phantom: PhantomData<K>,
}

impl<K: TrieKey, V: Clone + Send + Sync> ConcurrentTrie<K, V> {
    pub fn new() -> Self {
        Self::with_heap(Arc::new(GlobalHeap))
    }

    pub fn with_heap(heap: Arc<dyn Heap>) -> Self {
        Self {
            core: Core::new(heap, Reclaim::Epoch(EpochDomain::global())),
            phantom: PhantomData,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.core.has(&encode(key))
    }

    pub fn find(&self, key: &K) -> Option<Entry<K, V>> {
        let bytes = encode(key);
        self.core.get(&bytes).map(|v| Entry::new(bytes, v))
    }

    pub fn insert(&self, key: &K, value: V) -> Result<(Entry<K, V>, bool)> {
        let bytes = encode(key);
        let (v, inserted) = self.core.insert_bytes(&bytes, value)?;
        Ok((Entry::new(bytes, v), inserted))
    }

    pub fn erase(&self, key: &K) -> Result<bool> {
        self.core.erase_bytes(&encode(key))
    }

    pub fn clear(&self) {
        self.core.clear();
    }

    pub fn size(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn begin(&self) -> Option<Entry<K, V>> {
        self.core.first().map(|(bytes, v)| Entry::new(bytes, v))
    }

    pub fn swap(&mut self, other: &mut Self) {
        self.core.swap_with(&mut other.core);
    }

    pub fn check(&self) -> anyhow::Result<u64> {
        self.core.check()
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            core: self
                .core
                .deep_clone(Reclaim::Epoch(EpochDomain::global()))?,
            phantom: PhantomData,
        })
    }
}

impl<K: TrieKey, V: Clone + Send + Sync> Default for ConcurrentTrie<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TrieKey, V: Clone + Send + Sync> Clone for ConcurrentTrie<K, V> {
    fn clone(&self) -> Self {
        self.try_clone().expect("trie clone: allocation failed")
    }
}

//-------------------------------------------------------------------------
