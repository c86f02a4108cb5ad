//! Multi-indexed piece store.
//!
//! One owning map plus three derived orderings over the same entries:
//!
//! - location order, for point lookup and per-storage ranges
//! - `cheap_to_flush` descending, for partial flushes that avoid read-back
//! - `ready_to_flush` first, for flushing finished pieces
//!
//! Derived keys change when cursors or flags change, so every mutation goes
//! through [`PieceStore::modify`], which rekeys the side tables atomically
//! with the field change.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use crate::job::{PieceIndex, PieceLocation, StorageId};
use crate::piece::PieceEntry;

pub(crate) struct PieceStore {
    pieces: HashMap<PieceLocation, PieceEntry>,
    by_location: BTreeSet<PieceLocation>,
    by_cheap: BTreeSet<(Reverse<usize>, PieceLocation)>,
    by_ready: BTreeSet<(Reverse<bool>, PieceLocation)>,
}

impl PieceStore {
    pub(crate) fn new() -> Self {
        Self {
            pieces: HashMap::new(),
            by_location: BTreeSet::new(),
            by_cheap: BTreeSet::new(),
            by_ready: BTreeSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pieces.len()
    }

    pub(crate) fn contains(&self, loc: &PieceLocation) -> bool {
        self.pieces.contains_key(loc)
    }

    pub(crate) fn get(&self, loc: &PieceLocation) -> Option<&PieceEntry> {
        self.pieces.get(loc)
    }

    pub(crate) fn insert(&mut self, entry: PieceEntry) {
        let loc = entry.location;
        debug_assert!(!self.pieces.contains_key(&loc));
        self.by_location.insert(loc);
        self.by_cheap.insert((Reverse(entry.cheap_to_flush()), loc));
        self.by_ready.insert((Reverse(entry.ready_to_flush), loc));
        self.pieces.insert(loc, entry);
    }

    pub(crate) fn remove(&mut self, loc: &PieceLocation) -> Option<PieceEntry> {
        let entry = self.pieces.remove(loc)?;
        self.by_location.remove(loc);
        self.by_cheap.remove(&(Reverse(entry.cheap_to_flush()), *loc));
        self.by_ready.remove(&(Reverse(entry.ready_to_flush), *loc));
        Some(entry)
    }

    /// Mutates an entry and rekeys the derived indexes to match. All writes
    /// to stored entries must go through here; the closure must not change
    /// `location`.
    pub(crate) fn modify<R>(
        &mut self,
        loc: &PieceLocation,
        f: impl FnOnce(&mut PieceEntry) -> R,
    ) -> Option<R> {
        let entry = self.pieces.get_mut(loc)?;
        let old_cheap = entry.cheap_to_flush();
        let old_ready = entry.ready_to_flush;
        let ret = f(entry);
        debug_assert_eq!(entry.location, *loc);
        let new_cheap = entry.cheap_to_flush();
        let new_ready = entry.ready_to_flush;
        if new_cheap != old_cheap {
            self.by_cheap.remove(&(Reverse(old_cheap), *loc));
            self.by_cheap.insert((Reverse(new_cheap), *loc));
        }
        if new_ready != old_ready {
            self.by_ready.remove(&(Reverse(old_ready), *loc));
            self.by_ready.insert((Reverse(new_ready), *loc));
        }
        Some(ret)
    }

    /// Locations of pieces currently ready to flush, location order within
    /// the ready prefix.
    pub(crate) fn ready_pieces(&self) -> Vec<PieceLocation> {
        self.by_ready
            .iter()
            .take_while(|(ready, _)| ready.0)
            .map(|(_, loc)| *loc)
            .collect()
    }

    /// Locations with at least one cheap-to-flush block, most first.
    pub(crate) fn cheapest_pieces(&self) -> Vec<PieceLocation> {
        self.by_cheap
            .iter()
            .take_while(|(cheap, _)| cheap.0 > 0)
            .map(|(_, loc)| *loc)
            .collect()
    }

    /// All locations in location order.
    pub(crate) fn locations(&self) -> Vec<PieceLocation> {
        self.by_location.iter().copied().collect()
    }

    /// All locations under one storage, in piece order.
    pub(crate) fn storage_pieces(&self, storage: StorageId) -> Vec<PieceLocation> {
        let start = PieceLocation::new(storage, PieceIndex::MIN);
        let end = PieceLocation::new(storage, PieceIndex::MAX);
        self.by_location.range(start..=end).copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PieceEntry> {
        self.pieces.values()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_consistency(&self) {
        assert_eq!(self.pieces.len(), self.by_location.len());
        assert_eq!(self.pieces.len(), self.by_cheap.len());
        assert_eq!(self.pieces.len(), self.by_ready.len());
        for (loc, entry) in &self.pieces {
            assert!(self.by_location.contains(loc));
            assert!(self
                .by_cheap
                .contains(&(Reverse(entry.cheap_to_flush()), *loc)));
            assert!(self
                .by_ready
                .contains(&(Reverse(entry.ready_to_flush), *loc)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(storage: StorageId, piece: PieceIndex) -> PieceEntry {
        PieceEntry::new(PieceLocation::new(storage, piece), 4, true, false)
    }

    #[test]
    fn test_ready_pieces_orders_ready_first() {
        let mut store = PieceStore::new();
        store.insert(entry(0, 0));
        store.insert(entry(0, 1));
        store.insert(entry(0, 2));

        store.modify(&PieceLocation::new(0, 1), |e| e.ready_to_flush = true);
        assert_eq!(store.ready_pieces(), vec![PieceLocation::new(0, 1)]);

        store.modify(&PieceLocation::new(0, 1), |e| e.ready_to_flush = false);
        assert!(store.ready_pieces().is_empty());
    }

    #[test]
    fn test_cheapest_pieces_orders_descending() {
        let mut store = PieceStore::new();
        store.insert(entry(0, 0));
        store.insert(entry(0, 1));
        store.insert(entry(0, 2));

        store.modify(&PieceLocation::new(0, 0), |e| e.hasher_cursor = 1);
        store.modify(&PieceLocation::new(0, 2), |e| e.hasher_cursor = 3);

        assert_eq!(
            store.cheapest_pieces(),
            vec![PieceLocation::new(0, 2), PieceLocation::new(0, 0)]
        );
    }

    #[test]
    fn test_modify_rekeys_after_cursor_moves() {
        let mut store = PieceStore::new();
        store.insert(entry(0, 0));

        store.modify(&PieceLocation::new(0, 0), |e| e.hasher_cursor = 2);
        assert_eq!(store.cheapest_pieces().len(), 1);

        // flushing catches up; the piece leaves the cheap view
        store.modify(&PieceLocation::new(0, 0), |e| e.flushed_cursor = 2);
        assert!(store.cheapest_pieces().is_empty());

        #[cfg(debug_assertions)]
        store.check_consistency();
    }

    #[test]
    fn test_storage_pieces_returns_contiguous_range() {
        let mut store = PieceStore::new();
        store.insert(entry(1, 5));
        store.insert(entry(2, 0));
        store.insert(entry(1, 2));
        store.insert(entry(3, 7));

        assert_eq!(
            store.storage_pieces(1),
            vec![PieceLocation::new(1, 2), PieceLocation::new(1, 5)]
        );
        assert!(store.storage_pieces(4).is_empty());
    }

    #[test]
    fn test_remove_clears_all_views() {
        let mut store = PieceStore::new();
        store.insert(entry(0, 0));
        store.modify(&PieceLocation::new(0, 0), |e| {
            e.hasher_cursor = 1;
            e.ready_to_flush = true;
        });

        let removed = store.remove(&PieceLocation::new(0, 0));
        assert!(removed.is_some());
        assert_eq!(store.len(), 0);
        assert!(store.ready_pieces().is_empty());
        assert!(store.cheapest_pieces().is_empty());
        assert!(store.locations().is_empty());
    }
}
