//! Lock-free hash map: a sorted linked list overlaid with a skip-index.
//!
//! Entries form one singly linked list ordered by `(hash, key)`. The index is
//! a power-of-two table; slot `hash >> shift` points at the entry with the
//! smallest hash routed to that slot. A lookup jumps to the slot and walks
//! right until it meets its key or passes it.
//!
//! Nodes live in an append-only [`Arena`] and are linked by index, so the list
//! is only ever changed by a compare-and-swap on a `next` field. Deletion is
//! logical: the value is swapped out for null and the node stays linked as a
//! tombstone, to be reused if the key comes back. Growing the index rebuilds
//! it from the list and swaps the table pointer; the list itself is never
//! touched, so readers on a stale table still find every entry.
//!
//! `crossbeam-epoch` reclaims replaced values and retired index tables once no
//! reader can still see them.

use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use super::arena::Arena;

const NIL: usize = usize::MAX;
const EMPTY_SLOT: usize = 0;
/// Index size used by [`SortedIndexMap::new`].
pub const DEFAULT_INDEX_SIZE: usize = 8;
/// Grow once more than this share of slots is occupied.
pub const MAX_FILL_RATE_PERCENT: usize = 50;

struct Node<V> {
    key: String,
    hash: u64,
    next: AtomicUsize,
    value: Atomic<V>,
}

impl<V> Node<V> {
    fn order(&self, hash: u64, key: &str) -> CmpOrdering {
        self.hash
            .cmp(&hash)
            .then_with(|| self.key.as_str().cmp(key))
    }
}

impl<V> Drop for Node<V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach this node.
        unsafe {
            let guard = epoch::unprotected();
            let value = self.value.load(Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

struct IndexTable {
    /// Node index + 1, or [`EMPTY_SLOT`].
    slots: Box<[AtomicUsize]>,
    shift: u32,
    occupied: AtomicUsize,
}

impl IndexTable {
    fn with_size(size: usize) -> Self {
        let size = size.max(2).next_power_of_two();
        Self {
            slots: (0..size).map(|_| AtomicUsize::new(EMPTY_SLOT)).collect(),
            shift: u64::BITS - size.trailing_zeros(),
            occupied: AtomicUsize::new(0),
        }
    }

    fn slot_of(&self, hash: u64) -> usize {
        (hash >> self.shift) as usize
    }

    fn over_filled(&self) -> bool {
        self.occupied.load(Ordering::Relaxed) * 100 / self.slots.len() > MAX_FILL_RATE_PERCENT
    }
}

pub struct SortedIndexMap<V> {
    nodes: Arena<Node<V>>,
    head: AtomicUsize,
    index: Atomic<IndexTable>,
    len: AtomicUsize,
    hasher: RandomState,
    resizing: Mutex<()>,
}

impl<V> SortedIndexMap<V>
where
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_index_size(DEFAULT_INDEX_SIZE)
    }

    /// `size` is rounded up to a power of two.
    pub fn with_index_size(size: usize) -> Self {
        Self {
            nodes: Arena::new(),
            head: AtomicUsize::new(NIL),
            index: Atomic::new(IndexTable::with_size(size)),
            len: AtomicUsize::new(0),
            hasher: RandomState::new(),
            resizing: Mutex::new(()),
        }
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of index slots.
    pub fn index_size(&self) -> usize {
        let guard = epoch::pin();
        self.table(&guard).slots.len()
    }

    /// Occupied share of the index, in percent.
    pub fn fill_rate(&self) -> usize {
        let guard = epoch::pin();
        let table = self.table(&guard);
        table.occupied.load(Ordering::Relaxed) * 100 / table.slots.len()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let (_, found) = self.locate(hash, key, &guard);
        if found == NIL || self.node(found).order(hash, key) != CmpOrdering::Equal {
            return None;
        }
        let value = self.node(found).value.load(Ordering::Acquire, &guard);
        // SAFETY: loaded under `guard`; a concurrent swap only defers the drop.
        unsafe { value.as_ref() }.cloned()
    }

    /// Insert or replace. Returns true when the key was not live before.
    pub fn insert(&self, key: &str, value: V) -> bool {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let mut fresh: Option<usize> = None;

        let target = loop {
            let (link, succ) = self.locate(hash, key, &guard);
            if succ != NIL && self.node(succ).order(hash, key) == CmpOrdering::Equal {
                // Existing entry or tombstone. A fresh node from a lost race
                // stays unlinked with a null value.
                break succ;
            }

            let idx = *fresh.get_or_insert_with(|| {
                self.nodes.push(Node {
                    key: key.to_string(),
                    hash,
                    next: AtomicUsize::new(NIL),
                    value: Atomic::null(),
                })
            });
            self.node(idx).next.store(succ, Ordering::Relaxed);
            if link
                .compare_exchange(succ, idx, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let table = self.table(&guard);
                self.add_to_index(table, idx);
                break idx;
            }
        };

        let previous = self
            .node(target)
            .value
            .swap(Owned::new(value), Ordering::AcqRel, &guard);
        let added = previous.is_null();
        if added {
            self.len.fetch_add(1, Ordering::AcqRel);
        } else {
            // SAFETY: unreachable from the map now; readers still holding it
            // are pinned, so destruction waits for them.
            unsafe { guard.defer_destroy(previous) };
        }

        let table = self.index.load(Ordering::Acquire, &guard);
        self.grow_if_needed(table);
        added
    }

    /// Logically delete `key`, returning its value if it was live.
    pub fn remove(&self, key: &str) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let (_, found) = self.locate(hash, key, &guard);
        if found == NIL || self.node(found).order(hash, key) != CmpOrdering::Equal {
            return None;
        }

        let previous = self
            .node(found)
            .value
            .swap(Shared::null(), Ordering::AcqRel, &guard);
        if previous.is_null() {
            return None;
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: as in `insert`; the clone happens while still pinned.
        let value = unsafe { previous.deref() }.clone();
        unsafe { guard.defer_destroy(previous) };
        Some(value)
    }

    /// Live entries in list order.
    pub fn entries(&self) -> Vec<(String, V)> {
        let guard = epoch::pin();
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head.load(Ordering::Acquire);
        while cursor != NIL {
            let node = self.node(cursor);
            let value = node.value.load(Ordering::Acquire, &guard);
            // SAFETY: loaded under `guard`.
            if let Some(v) = unsafe { value.as_ref() } {
                out.push((node.key.clone(), v.clone()));
            }
            cursor = node.next.load(Ordering::Acquire);
        }
        out
    }

    /// Resize the index to `size` slots (rounded up to a power of two), or
    /// double it when `size` is 0. Blocks while another resize runs.
    pub fn grow(&self, size: usize) {
        let _resizing = self.resizing.lock().unwrap_or_else(PoisonError::into_inner);
        self.rebuild(size);
    }

    fn grow_if_needed(&self, seen: Shared<'_, IndexTable>) {
        // SAFETY: `seen` was loaded under the caller's guard.
        let Some(table) = (unsafe { seen.as_ref() }) else {
            return;
        };
        if !table.over_filled() {
            return;
        }
        let _resizing = match self.resizing.try_lock() {
            Ok(lock) => lock,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            // Someone else is already resizing.
            Err(TryLockError::WouldBlock) => return,
        };

        let guard = epoch::pin();
        if self.index.load(Ordering::Acquire, &guard).as_raw() != seen.as_raw() {
            return;
        }
        self.rebuild(0);
        loop {
            let table = self.table(&guard);
            if !table.over_filled() {
                break;
            }
            self.rebuild(0);
        }
    }

    /// Caller holds `resizing`.
    fn rebuild(&self, size: usize) {
        let guard = epoch::pin();
        let current = self.table(&guard);
        let size = if size == 0 {
            current.slots.len() << 1
        } else {
            size
        };

        let fresh = Owned::new(IndexTable::with_size(size)).into_shared(&guard);
        // SAFETY: `fresh` is ours until published below.
        let table = unsafe { fresh.deref() };
        self.fill_index(table);
        let old = self.index.swap(fresh, Ordering::AcqRel, &guard);
        // Entries linked while the table was being built.
        self.fill_index(table);
        // SAFETY: the old table is no longer reachable from `self.index`.
        unsafe { guard.defer_destroy(old) };
    }

    fn fill_index(&self, table: &IndexTable) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while cursor != NIL {
            self.add_to_index(table, cursor);
            cursor = self.node(cursor).next.load(Ordering::Acquire);
        }
    }

    /// Point the node's slot at it if the slot is empty or holds a larger
    /// entry.
    fn add_to_index(&self, table: &IndexTable, idx: usize) {
        let node = self.node(idx);
        let slot = &table.slots[table.slot_of(node.hash)];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if current != EMPTY_SLOT {
                let existing = self.node(current - 1);
                if existing.order(node.hash, &node.key) != CmpOrdering::Greater {
                    return;
                }
            }
            match slot.compare_exchange(current, idx + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if current == EMPTY_SLOT {
                        table.occupied.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Find the link after which `(hash, key)` belongs and the node currently
    /// behind it (the first node not smaller than the target, or [`NIL`]).
    fn locate<'a>(&'a self, hash: u64, key: &str, guard: &'a Guard) -> (&'a AtomicUsize, usize) {
        let mut link = match self.start_before(hash, key, guard) {
            Some(idx) => &self.node(idx).next,
            None => &self.head,
        };
        loop {
            let succ = link.load(Ordering::Acquire);
            if succ == NIL {
                return (link, NIL);
            }
            let node = self.node(succ);
            if node.order(hash, key) != CmpOrdering::Less {
                return (link, succ);
            }
            link = &node.next;
        }
    }

    /// Nearest indexed node strictly before the target. Falls back to earlier
    /// slots when the target's own slot is empty or starts after it.
    fn start_before(&self, hash: u64, key: &str, guard: &Guard) -> Option<usize> {
        let table = self.table(guard);
        let mut slot = table.slot_of(hash);
        loop {
            let raw = table.slots[slot].load(Ordering::Acquire);
            if raw != EMPTY_SLOT && self.node(raw - 1).order(hash, key) == CmpOrdering::Less {
                return Some(raw - 1);
            }
            if slot == 0 {
                return None;
            }
            slot -= 1;
        }
    }

    fn table<'g>(&self, guard: &'g Guard) -> &'g IndexTable {
        let table = self.index.load(Ordering::Acquire, guard);
        // SAFETY: the index is never null and retired tables outlive `guard`.
        unsafe { table.deref() }
    }

    fn node(&self, idx: usize) -> &Node<V> {
        match self.nodes.get(idx) {
            Some(node) => node,
            None => unreachable!("linked node {idx} missing from arena"),
        }
    }

    fn hash(&self, key: &str) -> u64 {
        self.hasher.hash_one(key)
    }
}

impl<V> Default for SortedIndexMap<V>
where
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for SortedIndexMap<V> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; nobody else can hold the table.
        unsafe {
            let guard = epoch::unprotected();
            let table = self.index.load(Ordering::Relaxed, guard);
            if !table.is_null() {
                drop(table.into_owned());
            }
        }
    }
}

impl<V> fmt::Debug for SortedIndexMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedIndexMap")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
