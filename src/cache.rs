use crate::node::Edge;
use crate::AlignedBox;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Operation identifiers for cache keys.
pub mod op {
    pub const AND: u8 = 0;
    pub const XOR: u8 = 1;
    pub const ITE: u8 = 2;
    pub const COMPOSE: u8 = 3;
    pub const EXISTS: u8 = 4;
}

/// One cache line worth of entry: a version word, the three key words and
/// the result. The version word makes the entry a tiny seqlock; an odd
/// value means a write is in flight, zero means the slot has never been
/// written since the last clear.
struct CacheSlot {
    version: AtomicU64,
    a: AtomicU64,
    b: AtomicU64,
    c: AtomicU64,
    result: AtomicU64,
}

/// A lossy memoization table for the apply algorithms.
///
/// Entries are overwritten on collision; a lost entry only costs a
/// recomputation. The operation identifier is folded into the spare bits of
/// the first key word (edges use the top bit and the low 40, leaving the
/// middle free), so a key is exactly three words.
pub struct OpCache {
    slots: AlignedBox<CacheSlot>,
    mask: u64,
}

const OP_SHIFT: u32 = 48;

#[inline]
fn key_a(op: u8, a: Edge) -> u64 {
    u64::from(a) | (u64::from(op) << OP_SHIFT)
}

impl OpCache {
    /// Create a cache with `capacity` entries (rounded up to a power of
    /// two).
    pub fn new(capacity: usize) -> OpCache {
        let capacity = capacity.next_power_of_two().max(1 << 10);
        OpCache {
            slots: AlignedBox::zeroed(capacity),
            mask: (capacity - 1) as u64,
        }
    }

    #[inline]
    fn slot(&self, op: u8, a: Edge, b: Edge, c: Edge) -> &CacheSlot {
        let h = fxhash::hash64(&(key_a(op, a), u64::from(b), u64::from(c)));
        &self.slots[(h & self.mask) as usize]
    }

    /// Record `result` for the given key. Skipped when another writer holds
    /// the slot; the cache is allowed to lose entries, never to lie.
    pub fn put(&self, op: u8, a: Edge, b: Edge, c: Edge, result: u64) {
        let slot = self.slot(op, a, b, c);
        let v0 = slot.version.load(Ordering::Relaxed);
        if v0 & 1 != 0 {
            return;
        }
        if slot
            .version
            .compare_exchange(v0, v0 + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        slot.a.store(key_a(op, a), Ordering::Relaxed);
        slot.b.store(u64::from(b), Ordering::Relaxed);
        slot.c.store(u64::from(c), Ordering::Relaxed);
        slot.result.store(result, Ordering::Relaxed);
        slot.version.store(v0 + 2, Ordering::Release);
    }

    pub fn get(&self, op: u8, a: Edge, b: Edge, c: Edge) -> Option<u64> {
        let slot = self.slot(op, a, b, c);
        let v0 = slot.version.load(Ordering::Acquire);
        if v0 == 0 || v0 & 1 != 0 {
            return None;
        }
        let sa = slot.a.load(Ordering::Relaxed);
        let sb = slot.b.load(Ordering::Relaxed);
        let sc = slot.c.load(Ordering::Relaxed);
        let result = slot.result.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if slot.version.load(Ordering::Relaxed) != v0 {
            return None;
        }
        if sa == key_a(op, a) && sb == u64::from(b) && sc == u64::from(c) {
            Some(result)
        } else {
            None
        }
    }

    /// Invalidate everything. Must run before any operation that rewrites
    /// nodes in place (garbage collection, swaps), since keyed edges would
    /// otherwise refer to recycled slots.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.version.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{op, OpCache};
    use crate::node::Edge;

    #[test]
    pub fn hit_after_put() {
        let cache = OpCache::new(1 << 12);
        let (a, b) = (Edge::new(10), Edge::new(20));
        assert_eq!(cache.get(op::AND, a, b, Edge::INVALID), None);
        cache.put(op::AND, a, b, Edge::INVALID, 42);
        assert_eq!(cache.get(op::AND, a, b, Edge::INVALID), Some(42));
    }

    #[test]
    pub fn op_is_part_of_the_key() {
        let cache = OpCache::new(1 << 12);
        let (a, b) = (Edge::new(10), Edge::new(20));
        cache.put(op::AND, a, b, Edge::INVALID, 1);
        assert_eq!(cache.get(op::XOR, a, b, Edge::INVALID), None);
    }

    #[test]
    pub fn complement_is_part_of_the_key() {
        let cache = OpCache::new(1 << 12);
        let (a, b) = (Edge::new(10), Edge::new(20));
        cache.put(op::AND, a, b, Edge::INVALID, 1);
        assert_eq!(cache.get(op::AND, a.complemented(), b, Edge::INVALID), None);
    }

    #[test]
    pub fn clear_forgets() {
        let cache = OpCache::new(1 << 12);
        let (a, b) = (Edge::new(10), Edge::new(20));
        cache.put(op::AND, a, b, Edge::INVALID, 7);
        cache.clear();
        assert_eq!(cache.get(op::AND, a, b, Edge::INVALID), None);
    }
}
