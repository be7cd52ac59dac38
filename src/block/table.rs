//! The block table: a versioned array mapping each [`BlockNum`] to its
//! on-disk location, keyed by a small integer id. It keeps two on-disk
//! views — `current` (what readers see) and `inprogress` (accumulates a
//! checkpoint's new translations until published) — as a single
//! implementation parameterized by [`View`] rather than two hand-duplicated
//! sets of methods.

use crate::block::allocator::{BlockAllocator, Extent};
use crate::error::{Result, StoreError};

/// A block identifier: an index into the translation table, not a byte
/// offset. Two values are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode)]
pub struct BlockNum(u64);

impl BlockNum {
    /// No block: an empty child pointer, or "not yet allocated."
    pub const NULL: BlockNum = BlockNum(u64::MAX);
    /// The reserved blocknum the translation table itself is stored at.
    pub const TRANSLATION: BlockNum = BlockNum(0);

    #[must_use]
    pub fn new(value: u64) -> Self {
        BlockNum(value)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Where a block lives on disk and how to validate it once read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockTranslation {
    pub offset: u64,
    pub size: u64,
    pub checksum: u32,
}

/// Which of the block table's two on-disk views an operation targets:
/// `Current` is what readers see; `InProgress` accumulates a checkpoint's
/// new translations until it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Current,
    InProgress,
}

/// Maps [`BlockNum`] to [`BlockTranslation`], backed by a single
/// [`BlockAllocator`] — the table and the allocator always agree on which
/// byte ranges are live.
#[derive(Debug)]
pub struct BlockTable {
    current: Vec<Option<BlockTranslation>>,
    inprogress: Vec<Option<BlockTranslation>>,
    allocator: BlockAllocator,
    next_blocknum: u64,
}

impl BlockTable {
    #[must_use]
    pub fn create(allocator: BlockAllocator) -> Self {
        Self { current: Vec::new(), inprogress: Vec::new(), allocator, next_blocknum: 1 }
    }

    fn table_mut(&mut self, view: View) -> &mut Vec<Option<BlockTranslation>> {
        match view {
            View::Current => &mut self.current,
            View::InProgress => &mut self.inprogress,
        }
    }

    fn table(&self, view: View) -> &Vec<Option<BlockTranslation>> {
        match view {
            View::Current => &self.current,
            View::InProgress => &self.inprogress,
        }
    }

    /// Looks up where `blocknum` lives in `view`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if `blocknum` has no translation
    /// in that view (e.g. it was never assigned, or it was freed).
    pub fn get(&self, view: View, blocknum: BlockNum) -> Result<BlockTranslation> {
        if blocknum.is_null() {
            return Err(StoreError::NotFound("get: blocknum is NULL".into()));
        }
        self.table(view)
            .get(blocknum.as_u64() as usize)
            .and_then(|slot| *slot)
            .ok_or_else(|| StoreError::NotFound(format!("get: no translation for {blocknum:?}")))
    }

    /// Reserves a fresh [`BlockNum`] with no translation yet assigned in
    /// either view, for the common case of allocating a blocknum before
    /// the node it names has actually been written.
    pub fn allocate_new(&mut self) -> BlockNum {
        let blocknum = BlockNum::new(self.next_blocknum);
        self.next_blocknum += 1;
        for view in [View::Current, View::InProgress] {
            let table = self.table_mut(view);
            let idx = blocknum.as_u64() as usize;
            if table.len() <= idx {
                table.resize(idx + 1, None);
            }
        }
        blocknum
    }

    /// Allocates `size` bytes from the allocator and records the result as
    /// `blocknum`'s translation in `view`.
    ///
    /// # Errors
    /// Propagates allocator corruption errors.
    pub fn assign_new_extent(
        &mut self,
        view: View,
        blocknum: BlockNum,
        size: u64,
        checksum: u32,
    ) -> Result<BlockTranslation> {
        let offset = self.allocator.alloc(size)?;
        let translation = BlockTranslation { offset, size, checksum };
        self.assign(view, blocknum, translation)?;
        Ok(translation)
    }

    /// Directly records `translation` for `blocknum` in `view`, without
    /// touching the allocator (used when reloading a table at open time,
    /// where the allocator is populated separately via `alloc_many`).
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if `blocknum` is NULL.
    pub fn assign(&mut self, view: View, blocknum: BlockNum, translation: BlockTranslation) -> Result<()> {
        if blocknum.is_null() {
            return Err(StoreError::Corruption("assign: blocknum is NULL".into()));
        }
        let idx = blocknum.as_u64() as usize;
        let table = self.table_mut(view);
        if table.len() <= idx {
            table.resize(idx + 1, None);
        }
        table[idx] = Some(translation);
        Ok(())
    }

    /// Frees `blocknum`'s extent from the allocator and clears its
    /// translation in `view`.
    ///
    /// # Errors
    /// Propagates allocator corruption if nothing was allocated there.
    pub fn note_free(&mut self, view: View, blocknum: BlockNum) -> Result<()> {
        let idx = blocknum.as_u64() as usize;
        let table = self.table_mut(view);
        let Some(slot) = table.get_mut(idx) else {
            return Err(StoreError::Corruption(format!("note_free: {blocknum:?} out of range")));
        };
        let Some(translation) = slot.take() else {
            return Err(StoreError::Corruption(format!(
                "note_free: {blocknum:?} has no translation in this view"
            )));
        };
        self.allocator.free(translation.offset)
    }

    /// Begins a checkpoint: clones `current` into `inprogress` so that new
    /// writes during the checkpoint accumulate separately.
    pub fn checkpoint_begin(&mut self) {
        self.inprogress = self.current.clone();
    }

    /// Ends a checkpoint: publishes `inprogress` as the new `current`.
    pub fn checkpoint_end(&mut self) {
        self.current = std::mem::take(&mut self.inprogress);
    }

    /// Rebuilds a table from a previously-persisted translation-table blob,
    /// reloading the translation table on open and then rebuilding the
    /// allocator's live-extent set from it.
    ///
    /// # Errors
    /// Propagates corruption from a duplicate or NULL blocknum, or from
    /// overlapping extents once the allocator is rebuilt.
    pub fn from_translations(allocator: BlockAllocator, entries: &[(BlockNum, BlockTranslation)]) -> Result<Self> {
        let mut table = Self::create(allocator);
        let mut max_blocknum = 0u64;
        for &(blocknum, translation) in entries {
            table.assign(View::Current, blocknum, translation)?;
            max_blocknum = max_blocknum.max(blocknum.as_u64());
        }
        table.next_blocknum = max_blocknum + 1;
        table.rebuild_allocator_from_current()?;
        Ok(table)
    }

    /// Reloads the allocator's live-extent set from every non-null
    /// translation in the current view, used at file-open time after the
    /// table itself has been read from disk.
    ///
    /// # Errors
    /// Propagates corruption if the translations overlap.
    pub fn rebuild_allocator_from_current(&mut self) -> Result<()> {
        let pairs: Vec<Extent> = self
            .current
            .iter()
            .filter_map(|slot| slot.map(|t| Extent { offset: t.offset, size: t.size }))
            .collect();
        self.allocator.alloc_many(pairs)
    }

    /// Every assigned `(blocknum, translation)` pair in `view`, for
    /// building the on-disk translation-table blob at checkpoint end.
    pub fn iter_view(&self, view: View) -> impl Iterator<Item = (BlockNum, BlockTranslation)> + '_ {
        self.table(view).iter().enumerate().filter_map(|(idx, slot)| {
            slot.map(|t| (BlockNum::new(idx as u64), t))
        })
    }

    #[must_use]
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut BlockAllocator {
        &mut self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_new_then_assign_roundtrips() {
        let mut table = BlockTable::create(BlockAllocator::create(4096, 4096));
        let bn = table.allocate_new();
        let translation = table.assign_new_extent(View::Current, bn, 4096, 0xdead_beef).unwrap();
        let got = table.get(View::Current, bn).unwrap();
        assert_eq!(got, translation);
    }

    #[test]
    fn get_on_unassigned_blocknum_is_not_found() {
        let mut table = BlockTable::create(BlockAllocator::create(4096, 4096));
        let bn = table.allocate_new();
        assert!(table.get(View::Current, bn).is_err());
    }

    #[test]
    fn checkpoint_begin_then_end_publishes_inprogress() {
        let mut table = BlockTable::create(BlockAllocator::create(4096, 4096));
        let bn = table.allocate_new();
        table.assign_new_extent(View::Current, bn, 4096, 1).unwrap();
        table.checkpoint_begin();
        let bn2 = table.allocate_new();
        table.assign_new_extent(View::InProgress, bn2, 4096, 2).unwrap();
        // current is untouched mid-checkpoint
        assert!(table.get(View::Current, bn2).is_err());
        table.checkpoint_end();
        assert!(table.get(View::Current, bn2).is_ok());
        assert!(table.get(View::Current, bn).is_ok());
    }

    #[test]
    fn note_free_clears_translation_and_allocator_extent() {
        let mut table = BlockTable::create(BlockAllocator::create(4096, 4096));
        let bn = table.allocate_new();
        let t = table.assign_new_extent(View::Current, bn, 4096, 1).unwrap();
        table.note_free(View::Current, bn).unwrap();
        assert!(table.get(View::Current, bn).is_err());
        assert!(table.allocator().size_at(t.offset).is_err());
    }

    #[test]
    fn from_translations_rebuilds_allocator_and_next_blocknum() {
        let mut original = BlockTable::create(BlockAllocator::create(4096, 4096));
        let a = original.allocate_new();
        let b = original.allocate_new();
        original.assign_new_extent(View::Current, a, 4096, 1).unwrap();
        original.assign_new_extent(View::Current, b, 8192, 2).unwrap();
        let entries: Vec<_> = original.iter_view(View::Current).collect();

        let rebuilt = BlockTable::from_translations(BlockAllocator::create(4096, 4096), &entries).unwrap();
        assert_eq!(rebuilt.get(View::Current, a).unwrap(), original.get(View::Current, a).unwrap());
        assert_eq!(rebuilt.get(View::Current, b).unwrap(), original.get(View::Current, b).unwrap());
        assert!(rebuilt.allocator().size_at(rebuilt.get(View::Current, b).unwrap().offset).is_ok());
    }

    #[test]
    fn null_blocknum_is_never_gettable() {
        let table = BlockTable::create(BlockAllocator::create(4096, 4096));
        assert!(table.get(View::Current, BlockNum::NULL).is_err());
    }
}
