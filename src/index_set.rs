use crate::bitmap::NPOS;
use crate::table::UniqueTable;
use roaring::RoaringBitmap;

/// A compressed set of unique-table slot indices.
///
/// Reordering iterates the live nodes many times (reference-count
/// initialisation, interaction-matrix construction); scanning the occupancy
/// bitmap each time would touch the whole table, so the controller
/// snapshots the occupied indices into this set once per pass.
pub struct NodeIdSet {
    ids: RoaringBitmap,
}

impl NodeIdSet {
    pub fn new() -> NodeIdSet {
        NodeIdSet {
            ids: RoaringBitmap::new(),
        }
    }

    /// Drop the previous snapshot and record every occupied slot of the
    /// table, skipping the two reserved ones.
    pub fn refill(&mut self, table: &UniqueTable) {
        self.ids.clear();
        let mut pos = table.next_occupied(1);
        while pos != NPOS {
            self.ids.insert(pos as u32);
            pos = table.next_occupied(pos);
        }
    }

    pub fn insert(&mut self, index: u64) {
        self.ids.insert(index as u32);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> u64 {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ascending iteration over the recorded indices.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().map(|i| i as u64)
    }
}

impl Default for NodeIdSet {
    fn default() -> Self {
        NodeIdSet::new()
    }
}

#[cfg(test)]
mod test {
    use super::NodeIdSet;
    use crate::table::UniqueTable;

    #[test]
    pub fn snapshot_matches_occupancy() {
        let table = UniqueTable::new(1 << 10, 1 << 10, 1);
        let mut expected = Vec::new();
        for i in 0..50u64 {
            let (idx, _) = table.lookup_or_insert(i, i + 100);
            expected.push(idx);
        }
        expected.sort_unstable();

        let mut ids = NodeIdSet::new();
        ids.refill(&table);
        let collected: Vec<u64> = ids.iter().collect();
        assert_eq!(collected, expected);
        assert_eq!(ids.len(), 50);

        // a second refill replaces, not extends
        ids.refill(&table);
        assert_eq!(ids.len(), 50);
    }
}
