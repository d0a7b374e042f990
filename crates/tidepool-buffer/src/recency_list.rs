//! Lock-free doubly linked list ordered by recency.
//!
//! The list has fixed head and tail sentinels. Deletion is logical first: a
//! node is deleted once the mark bit on its forward link is set, and a marked
//! forward link never changes again. Physical unlinking happens lazily, by
//! whichever traversal next walks past the marked node and wins the CAS that
//! swings its predecessor's forward link.
//!
//! Back links are hints. After concurrent inserts and deletes a node's back
//! link may point at a node that is no longer its live predecessor; readers
//! repair it with a forward walk ("fix forward") from the nearest live node.
//! Only forward reachability and the visibility of logical deletion are exact
//! at all times.
//!
//! Nodes live in a chunked arena of atomic slots addressed by `u32` index, so
//! a stale link can never dangle. Each slot carries a generation that is
//! bumped when the slot is unlinked; links and handles embed the generation
//! they were created with, so a link into a recycled slot is recognized as
//! stale. Unlinked slots return to the free queue only through a
//! `crossbeam-epoch` deferred function, after every thread that might still be
//! walking through them has unpinned.

use crate::frame::FrameId;
use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_queue::SegQueue;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Slots per arena chunk (log2).
const CHUNK_BITS: u32 = 12;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
/// Upper bound on arena chunks; caps the list at 16M simultaneous nodes.
const MAX_CHUNKS: usize = 4096;

const HEAD: u32 = 0;
const TAIL: u32 = 1;
const NIL: u32 = u32::MAX;

const MARK_BIT: u64 = 1 << 63;
const GEN_MASK: u32 = 0x7FFF_FFFF;

/// Backward steps taken before falling back to a scan from the head.
const MAX_BACK_STEPS: usize = 64;

/// Values that can be stored in a list node.
///
/// Node payloads are kept in a single atomic word.
pub trait SlotValue: Copy + Send + Sync + 'static {
    fn into_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl SlotValue for u64 {
    fn into_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> Self {
        bits
    }
}

impl SlotValue for u32 {
    fn into_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as u32
    }
}

impl SlotValue for FrameId {
    fn into_bits(self) -> u64 {
        self.0 as u64
    }

    fn from_bits(bits: u64) -> Self {
        FrameId(bits as u32)
    }
}

/// Stable reference to a node returned by a push.
///
/// A handle outlives its node safely: once the node is deleted and its slot
/// recycled, operations through the old handle report the node as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    fn link(self) -> Link {
        Link {
            index: self.index,
            generation: self.generation,
            marked: false,
        }
    }
}

/// Unpacked form of a link word: target slot, target generation, mark bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    index: u32,
    generation: u32,
    marked: bool,
}

impl Link {
    const NIL: Link = Link {
        index: NIL,
        generation: 0,
        marked: false,
    };

    fn pack(self) -> u64 {
        let mut word = self.index as u64 | ((self.generation & GEN_MASK) as u64) << 32;
        if self.marked {
            word |= MARK_BIT;
        }
        word
    }

    fn unpack(word: u64) -> Self {
        Link {
            index: word as u32,
            generation: ((word >> 32) as u32) & GEN_MASK,
            marked: word & MARK_BIT != 0,
        }
    }

    fn with_mark(self, marked: bool) -> Self {
        Link { marked, ..self }
    }

    fn handle(self) -> NodeHandle {
        NodeHandle {
            index: self.index,
            generation: self.generation,
        }
    }
}

struct Slot {
    next: AtomicU64,
    prev: AtomicU64,
    generation: AtomicU32,
    value: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(Link::NIL.pack()),
            prev: AtomicU64::new(Link::NIL.pack()),
            generation: AtomicU32::new(0),
            value: AtomicU64::new(0),
        }
    }
}

/// Append-only slot storage shared with deferred reclamation closures.
struct Arena {
    chunks: Box<[OnceLock<Box<[Slot]>>]>,
    next_fresh: AtomicU32,
    free: SegQueue<u32>,
}

impl Arena {
    fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            next_fresh: AtomicU32::new(0),
            free: SegQueue::new(),
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot {
        let chunk = (index >> CHUNK_BITS) as usize;
        let offset = index as usize & (CHUNK_SIZE - 1);
        match self.chunks[chunk].get() {
            Some(slots) => &slots[offset],
            None => unreachable!("slot {index} read before allocation"),
        }
    }

    fn alloc(&self) -> u32 {
        if let Some(index) = self.free.pop() {
            return index;
        }

        let index = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        let chunk = (index >> CHUNK_BITS) as usize;
        assert!(
            chunk < MAX_CHUNKS,
            "recency list exceeded {} live nodes",
            MAX_CHUNKS * CHUNK_SIZE
        );
        self.chunks[chunk].get_or_init(|| (0..CHUNK_SIZE).map(|_| Slot::new()).collect());
        index
    }

    fn allocated(&self) -> usize {
        self.next_fresh.load(Ordering::Relaxed) as usize
    }
}

/// Concurrent deque with O(1) removal of arbitrary nodes by handle.
pub struct RecencyList<V: SlotValue> {
    arena: Arc<Arena>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: SlotValue> RecencyList<V> {
    /// Creates an empty list.
    pub fn new() -> Self {
        let arena = Arena::new();
        let head = arena.alloc();
        let tail = arena.alloc();
        debug_assert_eq!((head, tail), (HEAD, TAIL));

        let list = Self {
            arena: Arc::new(arena),
            _marker: PhantomData,
        };
        list.slot(HEAD)
            .next
            .store(list.link_to(TAIL).pack(), Ordering::Release);
        list.slot(TAIL)
            .prev
            .store(list.link_to(HEAD).pack(), Ordering::Release);
        list
    }

    /// Inserts a value right after the head sentinel.
    pub fn push_head(&self, value: V) -> NodeHandle {
        let guard = epoch::pin();
        let node = self.new_node(value);
        while !self.insert_after(HEAD, node, &guard) {}
        node.handle()
    }

    /// Inserts a value right before the tail sentinel.
    pub fn push_tail(&self, value: V) -> NodeHandle {
        let guard = epoch::pin();
        let node = self.new_node(value);
        while !self.insert_before(self.link_to(TAIL), node, &guard) {}
        node.handle()
    }

    /// Returns the first live node, if any.
    pub fn head(&self) -> Option<(NodeHandle, V)> {
        let guard = epoch::pin();
        self.head_link(&guard)
            .map(|link| (link.handle(), self.load_value(link.index)))
    }

    /// Returns the last live node, if any.
    pub fn tail(&self) -> Option<(NodeHandle, V)> {
        let guard = epoch::pin();
        self.tail_link(&guard)
            .map(|link| (link.handle(), self.load_value(link.index)))
    }

    /// Removes and returns the first live value.
    pub fn pop_head(&self) -> Option<V> {
        let guard = epoch::pin();
        loop {
            let node = self.head_link(&guard)?;
            let value = self.load_value(node.index);
            if self.delete_node(node, true, &guard) {
                return Some(value);
            }
        }
    }

    /// Removes and returns the last live value.
    pub fn pop_tail(&self) -> Option<V> {
        let guard = epoch::pin();
        loop {
            let node = self.tail_link(&guard)?;
            let value = self.load_value(node.index);
            if self.delete_node(node, false, &guard) {
                return Some(value);
            }
        }
    }

    /// Logically deletes a node.
    ///
    /// Returns false if the node was already deleted, by this or any other
    /// thread.
    pub fn delete(&self, handle: &NodeHandle) -> bool {
        let guard = epoch::pin();
        self.delete_node(handle.link(), true, &guard)
    }

    /// Returns the value of a node that has not been deleted.
    pub fn value(&self, handle: &NodeHandle) -> Option<V> {
        let _guard = epoch::pin();
        let link = handle.link();
        if !self.is_current(link) || self.next(link.index).marked {
            return None;
        }
        let value = self.load_value(link.index);
        // Recheck: the slot cannot be recycled while pinned, but it may have
        // been deleted between the two loads.
        if self.next(link.index).marked {
            return None;
        }
        Some(value)
    }

    /// Returns true if the list has no live nodes.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head_link(&guard).is_none()
    }

    /// Returns the number of live nodes seen by a forward walk.
    pub fn len(&self) -> usize {
        self.iter_values().len()
    }

    /// Snapshot of live values from head to tail.
    ///
    /// Concurrent updates may or may not be reflected.
    pub fn iter_values(&self) -> Vec<V> {
        let _guard = epoch::pin();
        'restart: loop {
            let mut values = Vec::new();
            let mut current = HEAD;
            loop {
                let link = self.next(current);
                if link.index == TAIL {
                    return values;
                }
                if !self.is_current(link) {
                    continue 'restart;
                }
                if !self.next(link.index).marked {
                    values.push(self.load_value(link.index));
                }
                current = link.index;
            }
        }
    }

    #[cfg(test)]
    fn allocated_slots(&self) -> usize {
        self.arena.allocated()
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot {
        self.arena.slot(index)
    }

    #[inline]
    fn next(&self, index: u32) -> Link {
        Link::unpack(self.slot(index).next.load(Ordering::Acquire))
    }

    #[inline]
    fn prev(&self, index: u32) -> Link {
        Link::unpack(self.slot(index).prev.load(Ordering::Acquire))
    }

    /// Unmarked link to the current incarnation of a slot.
    #[inline]
    fn link_to(&self, index: u32) -> Link {
        Link {
            index,
            generation: self.slot(index).generation.load(Ordering::Acquire),
            marked: false,
        }
    }

    /// True if the link targets the live incarnation of its slot.
    #[inline]
    fn is_current(&self, link: Link) -> bool {
        link.index != NIL
            && self.slot(link.index).generation.load(Ordering::Acquire) == link.generation
    }

    #[inline]
    fn cas_next(&self, index: u32, current: Link, new: Link) -> bool {
        self.slot(index)
            .next
            .compare_exchange(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn load_value(&self, index: u32) -> V {
        V::from_bits(self.slot(index).value.load(Ordering::Acquire))
    }

    fn new_node(&self, value: V) -> Link {
        let index = self.arena.alloc();
        self.slot(index)
            .value
            .store(value.into_bits(), Ordering::Release);
        self.link_to(index)
    }

    /// Invalidates a physically unlinked slot and queues it for reuse.
    ///
    /// Only the thread whose CAS unlinked the slot calls this.
    fn retire(&self, index: u32, guard: &Guard) {
        let slot = self.slot(index);
        let generation = slot.generation.load(Ordering::Acquire);
        slot.generation
            .store(generation.wrapping_add(1) & GEN_MASK, Ordering::Release);

        let arena = Arc::clone(&self.arena);
        guard.defer(move || arena.free.push(index));
    }

    fn head_link(&self, guard: &Guard) -> Option<Link> {
        loop {
            match self.fix_forward(HEAD, guard) {
                Some(link) if link.index == TAIL => return None,
                Some(link) => return Some(link),
                None => continue,
            }
        }
    }

    fn tail_link(&self, guard: &Guard) -> Option<Link> {
        let tail = self.link_to(TAIL);
        loop {
            match self.get_back(tail, guard) {
                Some(back) if back.index == HEAD => return None,
                Some(back) if !self.next(back.index).marked => return Some(back),
                _ => continue,
            }
        }
    }

    /// Returns the live successor of `this`, unlinking marked nodes on the
    /// way. None if `this` itself is deleted.
    fn fix_forward(&self, this: u32, guard: &Guard) -> Option<Link> {
        loop {
            let link = self.next(this);
            if link.marked {
                return None;
            }
            if !self.is_current(link) {
                continue;
            }
            if link.index == TAIL {
                self.reflect_forward(this);
                return Some(link);
            }

            let later_next = self.next(link.index);
            if !later_next.marked {
                self.reflect_forward(this);
                return Some(link);
            }

            if self.cas_next(this, link, later_next.with_mark(false)) {
                self.retire(link.index, guard);
            }
        }
    }

    /// Points the successor's back link at `prev` if it does not already.
    fn reflect_forward(&self, prev: u32) {
        let link = self.next(prev);
        if link.marked || !self.is_current(link) {
            return;
        }

        let prev_link = self.link_to(prev);
        let after = link.index;
        if self.prev(after) == prev_link {
            return;
        }
        if after == TAIL || !self.next(after).marked {
            self.slot(after)
                .prev
                .store(prev_link.pack(), Ordering::Release);
        }
    }

    /// Finds the node whose forward link points at `node`.
    ///
    /// Walks back links while they lead to deleted nodes, repairing with a
    /// forward walk when the back link is out of date. None if `node` was
    /// deleted meanwhile.
    fn get_back(&self, node: Link, guard: &Guard) -> Option<Link> {
        let mut current = node.index;
        for _ in 0..MAX_BACK_STEPS {
            let back = self.prev(current).with_mark(false);
            if !self.is_current(back) {
                break;
            }

            let back_next = self.next(back.index);
            if back_next.marked {
                current = back.index;
                continue;
            }
            if back_next == node {
                return Some(back);
            }

            match self.fix_forward_until(back, node, guard) {
                Some(found) => return Some(found),
                None if self.next(back.index).marked => current = back.index,
                None => return None,
            }
        }

        // The back chain is stale; the head always reaches every live node.
        self.fix_forward_until(self.link_to(HEAD), node, guard)
    }

    /// Walks forward from `this` until reaching the node linking to `later`.
    fn fix_forward_until(&self, this: Link, later: Link, guard: &Guard) -> Option<Link> {
        let mut work = this;
        loop {
            if self.next(this.index).marked {
                return None;
            }
            if later.index != TAIL && (!self.is_current(later) || self.next(later.index).marked) {
                return None;
            }
            if work.index == TAIL {
                return None;
            }

            let mut step = self.next(work.index);
            if !step.marked {
                self.fix_forward(work.index, guard);
                step = self.next(work.index);
            }

            if step.with_mark(false) == later {
                return Some(work);
            }
            if step.index == TAIL || !self.is_current(step) {
                return None;
            }
            work = step.with_mark(false);
        }
    }

    fn insert_between(&self, node: Link, prev: Link, aft: Link, _guard: &Guard) -> bool {
        let slot = self.slot(node.index);
        slot.prev.store(prev.pack(), Ordering::Release);
        slot.next.store(aft.with_mark(false).pack(), Ordering::Release);

        if self.cas_next(prev.index, aft.with_mark(false), node) {
            self.reflect_forward(node.index);
            return true;
        }
        false
    }

    fn insert_after(&self, prev: u32, node: Link, guard: &Guard) -> bool {
        loop {
            if self.next(prev).marked {
                return false;
            }
            let Some(aft) = self.fix_forward(prev, guard) else {
                return false;
            };
            if self.insert_between(node, self.link_to(prev), aft, guard) {
                return true;
            }
        }
    }

    fn insert_before(&self, following: Link, node: Link, guard: &Guard) -> bool {
        loop {
            if following.index != TAIL && self.next(following.index).marked {
                return false;
            }
            let Some(before) = self.get_back(following, guard) else {
                return false;
            };
            if self.insert_between(node, before, following, guard) {
                return true;
            }
        }
    }

    fn delete_node(&self, node: Link, retry: bool, guard: &Guard) -> bool {
        loop {
            if !self.is_current(node) {
                return false;
            }
            let next = self.next(node.index);
            if next.marked {
                return false;
            }
            if self.cas_next(node.index, next, next.with_mark(true)) {
                break;
            }
            if !retry {
                return false;
            }
        }

        // Help unlink the node we just marked.
        if let Some(back) = self.get_back(node, guard) {
            self.fix_forward(back.index, guard);
        }
        true
    }
}

impl<V: SlotValue> Default for RecencyList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SlotValue> std::fmt::Debug for RecencyList<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecencyList")
            .field("len", &self.len())
            .field("allocated", &self.arena.allocated())
            .finish()
    }
}
