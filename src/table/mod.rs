use crate::bitmap::AtomicBitmap;
use crate::hash::{tabhash16, HASH_SEED};
use crate::node::{self, Node};
use crossbeam_utils::CachePadded;
use likely_stable::likely;
use std::sync::atomic::{AtomicU64, Ordering};

/// Low 40 bits of a tag word: the next index in the collision chain.
pub(crate) const MASK_INDEX: u64 = 0x0000_00ff_ffff_ffff;
/// High 24 bits of a tag word: the hash fingerprint.
pub(crate) const MASK_HASH: u64 = 0xffff_ff00_0000_0000;

/// Written into a tag word while its node is being unlinked from a chain;
/// concurrent unlink traversals that observe it restart from the head.
const TOMBSTONE: u64 = u64::MAX;

/// Slots per allocation region: 8 words of the occupancy bitmap.
pub const REGION_SLOTS: usize = 512;

/// Granularity of the divide-and-conquer over the index space for the bulk
/// primitives. Small enough for work-stealing, large enough that the atomic
/// traffic does not dominate.
pub(crate) const BLOCK_SIZE: usize = 4096;

const NO_REGION: u64 = u64::MAX;

/// Callbacks for leaves whose payload is managed by the client (for example
/// interned strings or arbitrary-precision numbers).
#[derive(Copy, Clone)]
pub struct CustomLeafOps {
    pub hash: fn(a: u64, b: u64, seed: u64) -> u64,
    pub equals: fn(a: u64, b: u64, other_a: u64, other_b: u64) -> bool,
    pub create: fn(a: &mut u64, b: &mut u64),
    pub destroy: fn(a: u64, b: u64),
}

/// A lock-free hash set of node records.
///
/// Storage is two flat arrays: `table` holds one atomic head-of-chain per
/// bucket and `data` holds three 8-byte words per slot (tag word, then the
/// two content words). Collisions chain through the low 40 bits of the tag
/// word. Occupancy, region-claiming and custom-leaf flags live in separate
/// bitmaps so the bulk phases can scan them without touching node data.
///
/// All arrays are allocated for `max_size` up front (they are only ever
/// touched up to the active `size`, so untouched pages cost nothing on a
/// demand-paged system); growing the table is just a matter of widening the
/// active prefix and rehashing, which garbage collection does anyway.
///
/// `lookup_or_insert`, `rehash_bucket`, `clear_bucket_hash` and `mark` are
/// safe under unrestricted concurrency; everything else must run while the
/// workers are quiesced.
pub struct UniqueTable {
    size: usize,
    max_size: usize,
    bucket_mask: u64,
    table: crate::AlignedBox<AtomicU64>,
    data: crate::AlignedBox<AtomicU64>,
    occupied: AtomicBitmap,
    regions: AtomicBitmap,
    custom: AtomicBitmap,
    region_hint: Box<[CachePadded<AtomicU64>]>,
    workers: usize,
    custom_ops: Option<CustomLeafOps>,
}

impl UniqueTable {
    /// Create a table with `size` active slots out of `max_size` reserved
    /// ones (both powers of two, at least one region). Slots 0 and 1 are
    /// permanently occupied; the Boolean terminal record is written to
    /// slot 1.
    pub fn new(size: usize, max_size: usize, workers: usize) -> UniqueTable {
        assert!(size.is_power_of_two(), "table size must be a power of two");
        assert!(
            max_size.is_power_of_two(),
            "table max size must be a power of two"
        );
        assert!(size >= REGION_SLOTS, "table size must cover a region");
        assert!(size <= max_size, "initial size exceeds the maximum");
        let workers = workers.max(1);
        let table = UniqueTable {
            size,
            max_size,
            bucket_mask: (size - 1) as u64,
            table: crate::AlignedBox::zeroed(max_size),
            data: crate::AlignedBox::zeroed(3 * max_size),
            occupied: AtomicBitmap::new(max_size),
            regions: AtomicBitmap::new(max_size / REGION_SLOTS),
            custom: AtomicBitmap::new(max_size),
            region_hint: (0..workers + 1)
                .map(|_| CachePadded::new(AtomicU64::new(NO_REGION)))
                .collect(),
            workers,
            custom_ops: None,
        };
        table.occupied.set(0);
        table.occupied.set(1);
        table.store_node(1, Node::TERMINAL);
        table
    }

    pub fn set_custom_ops(&mut self, ops: CustomLeafOps) {
        self.custom_ops = Some(ops);
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Double the active slot count, up to the reserved maximum. Returns
    /// false when the table is already at full size. The caller must
    /// follow up with a hash clear and a rehash of the marked slots, since
    /// the bucket mask changes.
    pub fn grow(&mut self) -> bool {
        if self.size >= self.max_size {
            return false;
        }
        self.size *= 2;
        self.bucket_mask = (self.size - 1) as u64;
        true
    }

    #[inline]
    fn word(&self, index: u64, k: usize) -> &AtomicU64 {
        &self.data[3 * index as usize + k]
    }

    /// Read the content words of the node at `index`.
    #[inline]
    pub fn node(&self, index: u64) -> Node {
        Node::from_words(
            self.word(index, 1).load(Ordering::Relaxed),
            self.word(index, 2).load(Ordering::Relaxed),
        )
    }

    /// Overwrite the content words of the node at `index`. Only valid while
    /// the node is unhashed or the writer is the single producer of the
    /// slot.
    #[inline]
    pub fn store_node(&self, index: u64, node: Node) {
        let (a, b) = node.words();
        self.word(index, 1).store(a, Ordering::Relaxed);
        self.word(index, 2).store(b, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_mark_bit(&self, index: u64) {
        self.word(index, 1).fetch_or(node::MARK_BIT, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_mark_bit(&self, index: u64) {
        self.word(index, 1).fetch_and(!node::MARK_BIT, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_custom(&self, index: u64) -> bool {
        self.custom.get(index as usize)
    }

    fn hash_of(&self, index: u64) -> u64 {
        let a = self.word(index, 1).load(Ordering::Relaxed);
        let b = self.word(index, 2).load(Ordering::Relaxed);
        if self.is_custom(index) {
            (self.custom_ops.as_ref().expect("custom ops").hash)(a, b, HASH_SEED)
        } else {
            tabhash16(a, b)
        }
    }

    /// The region-hint slot of the calling worker. Threads outside the pool
    /// share the spare slot; the claim protocol stays correct because the
    /// occupancy bit is verified by `fetch_or`.
    #[inline]
    fn worker_slot(&self) -> usize {
        match rayon::current_thread_index() {
            Some(i) if i < self.workers => i,
            _ => self.workers,
        }
    }

    /// Claim a free data slot, scanning the worker's current region first
    /// and claiming fresh regions as needed. Returns `None` when every
    /// region has been claimed and scanned without finding space.
    fn claim_slot(&self) -> Option<u64> {
        let hint = &self.region_hint[self.worker_slot()];
        let nregions = (self.size / REGION_SLOTS) as u64;
        let mut region = hint.load(Ordering::Relaxed);
        loop {
            if region != NO_REGION {
                for w in 0..8u64 {
                    let word_idx = (region * 8 + w) as usize;
                    let word = self.occupied.word(word_idx);
                    loop {
                        let v = word.load(Ordering::Relaxed);
                        if v == !0u64 {
                            break;
                        }
                        let j = (!v).leading_zeros() as u64;
                        let mask = 0x8000_0000_0000_0000u64 >> j;
                        if word.fetch_or(mask, Ordering::Relaxed) & mask == 0 {
                            return Some((region * 8 + w) * 64 + j);
                        }
                    }
                }
            } else {
                // spread workers over the table on startup and after clears
                let spread =
                    (self.worker_slot() as u64 * nregions) / (self.workers as u64 + 1);
                region = if spread == 0 { nregions - 1 } else { spread - 1 };
            }
            // the current region is exhausted; claim another one, visiting
            // every region at most once before reporting the table full
            let mut budget = nregions;
            let mut claimed = false;
            while budget > 0 {
                budget -= 1;
                region += 1;
                if region >= nregions {
                    region = 0;
                }
                if self.regions.try_set(region as usize) {
                    claimed = true;
                    break;
                }
            }
            if !claimed {
                return None;
            }
            hint.store(region, Ordering::Relaxed);
        }
    }

    #[inline]
    fn release_slot(&self, index: u64) {
        self.occupied.clear(index as usize);
    }

    /// Find the slot holding the record `(a, b)`, inserting it if absent.
    ///
    /// Returns the stable index (>= 2) and whether this call created the
    /// node. Index 0 means the table is full; the caller is expected to
    /// collect garbage and retry. Concurrent callers with equal arguments
    /// always agree on the index and exactly one of them observes
    /// `created == true`.
    pub fn lookup_or_insert(&self, a: u64, b: u64) -> (u64, bool) {
        self.lookup2(a, b, false)
    }

    /// As `lookup_or_insert`, but hashing and equality go through the
    /// custom leaf callbacks and a created slot gets the custom bit.
    pub fn lookup_or_insert_custom(&self, a: u64, b: u64) -> (u64, bool) {
        self.lookup2(a, b, true)
    }

    fn lookup2(&self, mut a: u64, mut b: u64, custom: bool) -> (u64, bool) {
        let ops = self.custom_ops.as_ref();
        let hash = if custom {
            (ops.expect("custom leaf callbacks not set").hash)(a, b, HASH_SEED)
        } else {
            tabhash16(a, b)
        };
        let hashm = hash & MASK_HASH;
        let bucket = &self.table[(hash & self.bucket_mask) as usize];

        let mut frst = bucket.load(Ordering::Relaxed);
        let mut cidx: u64 = 0;
        let mut idx = frst;
        // the chain has been scanned from the observed head down to `end`
        let mut end = 0u64;

        loop {
            if idx == end {
                if cidx == 0 {
                    match self.claim_slot() {
                        Some(claimed) => cidx = claimed,
                        None => return (0, false),
                    }
                    if custom {
                        (ops.unwrap().create)(&mut a, &mut b);
                    }
                    self.word(cidx, 1).store(a, Ordering::Relaxed);
                    self.word(cidx, 2).store(b, Ordering::Relaxed);
                }
                // publish our chain link before the head CAS so that anyone
                // who sees the new head also sees complete node data
                self.word(cidx, 0).store(hashm | frst, Ordering::Relaxed);
                match bucket.compare_exchange(frst, cidx, Ordering::Release, Ordering::Relaxed) {
                    Ok(_) => {
                        if custom {
                            self.custom.set(cidx as usize);
                        }
                        return (cidx, true);
                    }
                    Err(observed) => {
                        // someone else extended the chain; re-examine only
                        // the new prefix
                        end = frst;
                        frst = observed;
                        idx = observed;
                        continue;
                    }
                }
            }

            let v = self.word(idx, 0).load(Ordering::Relaxed);
            if v & MASK_HASH == hashm {
                let da = self.word(idx, 1).load(Ordering::Relaxed);
                let db = self.word(idx, 2).load(Ordering::Relaxed);
                let equal = if custom {
                    (ops.unwrap().equals)(a, b, da, db)
                } else {
                    likely(da == a && db == b)
                };
                if equal {
                    if cidx != 0 {
                        if custom {
                            (ops.unwrap().destroy)(a, b);
                        }
                        self.release_slot(cidx);
                    }
                    return (idx, false);
                }
            }
            idx = v & MASK_INDEX;
        }
    }

    /// Re-insert the node at `index` into its chain, recomputing its hash
    /// from the current content words. Used after a node has been rewritten
    /// in place.
    pub fn rehash_bucket(&self, index: u64) {
        let hash = self.hash_of(index);
        let hashm = hash & MASK_HASH;
        let bucket = &self.table[(hash & self.bucket_mask) as usize];
        let mut frst = bucket.load(Ordering::Relaxed);
        loop {
            self.word(index, 0).store(hashm | frst, Ordering::Relaxed);
            match bucket.compare_exchange(frst, index, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => frst = observed,
            }
        }
    }

    /// Unlink the node at `index` from its chain without touching its
    /// content words or occupancy bit. Returns false when the node was not
    /// hashed. Must not run concurrently with `lookup_or_insert`.
    pub fn clear_bucket_hash(&self, index: u64) -> bool {
        let dptr = self.word(index, 0);
        let mut d = dptr.load(Ordering::Relaxed);
        if d & MASK_INDEX != 0 {
            // leave the unlink-in-progress sentinel so traversals that pass
            // through us restart from the head
            while let Err(observed) =
                dptr.compare_exchange(d, TOMBSTONE, Ordering::Relaxed, Ordering::Relaxed)
            {
                d = observed;
            }
            d &= MASK_INDEX;
        } else {
            d = 0;
        }

        let hash = self.hash_of(index);
        let bucket = &self.table[(hash & self.bucket_mask) as usize];
        loop {
            let head = bucket.load(Ordering::Relaxed);
            if head == index {
                bucket.store(d, Ordering::Relaxed);
                return true;
            }
            let mut idx = head;
            loop {
                if idx == 0 {
                    return false;
                }
                let ptr = self.word(idx, 0);
                let v = ptr.load(Ordering::Relaxed);
                if v == TOMBSTONE {
                    // our predecessor is itself being unlinked, restart
                    break;
                }
                if v & MASK_INDEX == index {
                    if ptr
                        .compare_exchange(
                            v,
                            (v & MASK_HASH) | d,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                    break;
                }
                idx = v & MASK_INDEX;
            }
        }
    }

    /// Free the slot at `index`: clear occupancy and region claims and run
    /// the destroy callback if the slot held a custom leaf.
    pub fn clear_bucket_data(&self, index: u64) {
        self.occupied.clear(index as usize);
        self.regions.clear(index as usize / REGION_SLOTS);
        if self.custom.get(index as usize) {
            if let Some(ops) = &self.custom_ops {
                (ops.destroy)(
                    self.word(index, 1).load(Ordering::Relaxed),
                    self.word(index, 2).load(Ordering::Relaxed),
                );
            }
            self.custom.clear(index as usize);
        }
    }

    /// Reset occupancy and region claims, keeping slots 0 and 1. Part of
    /// the stop-the-world clear-and-mark sequence.
    pub fn bulk_clear_data(&self) {
        self.regions.clear_all();
        self.occupied.clear_all();
        self.occupied.set(0);
        self.occupied.set(1);
        for hint in self.region_hint.iter() {
            hint.store(NO_REGION, Ordering::Relaxed);
        }
    }

    /// Erase every chain head. Stop-the-world.
    pub fn bulk_clear_hashes(&self) {
        for head in self.table.iter() {
            head.store(0, Ordering::Relaxed);
        }
    }

    /// Set the occupancy bit of `index` if it was clear; the return value
    /// tells a marking traversal whether it owns the subtree below.
    #[inline]
    pub fn mark(&self, index: u64) -> bool {
        self.occupied.try_set(index as usize)
    }

    #[inline]
    pub fn is_marked(&self, index: u64) -> bool {
        self.occupied.get(index as usize)
    }

    /// Index of the first occupied slot after `pos`, or `NPOS`.
    #[inline]
    pub fn next_occupied(&self, pos: usize) -> usize {
        self.occupied.next(pos)
    }

    /// Number of occupied slots, including the two reserved ones.
    pub fn count_marked(&self) -> u64 {
        self.count_marked_range(0, self.size)
    }

    fn count_marked_range(&self, first: usize, count: usize) -> u64 {
        if count > REGION_SLOTS {
            let split = count / 2;
            let (left, right) = rayon::join(
                || self.count_marked_range(first, split),
                || self.count_marked_range(first + split, count - split),
            );
            left + right
        } else {
            let w0 = first / 64;
            let w1 = (first + count) / 64;
            let mut total = 0u64;
            for w in w0..w1 {
                total += self.occupied.word(w).load(Ordering::Relaxed).count_ones() as u64;
            }
            total
        }
    }

    /// Re-insert every marked slot after a full hash clear.
    pub fn rehash_all(&self) {
        self.rehash_range(0, self.size);
    }

    fn rehash_range(&self, first: usize, count: usize) {
        if count > REGION_SLOTS {
            let split = count / 2;
            rayon::join(
                || self.rehash_range(first, split),
                || self.rehash_range(first + split, count - split),
            );
            return;
        }
        let end = first + count;
        for k in first.max(2)..end {
            if self.is_marked(k as u64) {
                self.rehash_bucket(k as u64);
            }
        }
    }

    /// Run the destroy callback on custom leaves that did not survive a
    /// mark phase.
    pub fn destroy_unmarked(&self) {
        if self.custom_ops.is_none() {
            return;
        }
        self.destroy_range(0, self.size);
    }

    fn destroy_range(&self, first: usize, count: usize) {
        if count > 2 * REGION_SLOTS {
            let split = count / 2;
            rayon::join(
                || self.destroy_range(first, split),
                || self.destroy_range(first + split, count - split),
            );
            return;
        }
        let ops = self.custom_ops.as_ref().unwrap();
        for k in first..first + count {
            if !self.occupied.get(k) && self.custom.get(k) {
                (ops.destroy)(
                    self.word(k as u64, 1).load(Ordering::Relaxed),
                    self.word(k as u64, 2).load(Ordering::Relaxed),
                );
                self.custom.clear(k);
            }
        }
    }

    /// `(occupied slots, capacity)` for logging and resize decisions.
    pub fn usage(&self) -> (u64, u64) {
        (self.count_marked(), self.size as u64)
    }
}
