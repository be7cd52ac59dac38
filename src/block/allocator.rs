//! The block allocator owns one sorted, non-overlapping array of live
//! extents over a single file and answers "give me an aligned extent of N
//! bytes" with first-fit search, so that repeated alloc/free cycles
//! compact toward the start of the file and the tail can eventually be
//! truncated. All structural errors (overlap, misalignment, an extent
//! that doesn't exist) are treated as corruption and are fatal.

use crate::error::{Result, StoreError};

/// One live, allocated byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub size: u64,
}

/// First-fit allocator over a single file.
///
/// Internal invariant: `extents` is sorted strictly by `offset`, no two
/// extents overlap, and none overlaps `[0, reserve_at_beginning)`.
#[derive(Debug)]
pub struct BlockAllocator {
    reserve_at_beginning: u64,
    alignment: u64,
    extents: Vec<Extent>,
    total_allocated: u64,
}

impl BlockAllocator {
    /// Creates an allocator. `alignment` must be >= 512 and a multiple of
    /// 512. `reserve_at_beginning` bytes at offset 0 are never handed out.
    ///
    /// # Panics
    /// Panics (this is a configuration error, not a runtime corruption) if
    /// `alignment` is zero, below 512, or not a multiple of 512.
    #[must_use]
    pub fn create(reserve_at_beginning: u64, alignment: u64) -> Self {
        assert!(alignment >= 512 && alignment % 512 == 0, "alignment must be a multiple of 512");
        Self { reserve_at_beginning, alignment, extents: Vec::new(), total_allocated: 0 }
    }

    fn find_insert_pos(&self, offset: u64) -> usize {
        self.extents.partition_point(|e| e.offset < offset)
    }

    /// Finds the index of the extent occupying `offset`, if any.
    fn find_at(&self, offset: u64) -> Option<usize> {
        self.extents.binary_search_by_key(&offset, |e| e.offset).ok()
    }

    fn overlaps_any(&self, offset: u64, size: u64) -> bool {
        // Only the neighbors immediately before/after the insertion point
        // can possibly overlap, since the array is sorted and non-overlapping.
        let pos = self.find_insert_pos(offset);
        if pos > 0 {
            let prev = self.extents[pos - 1];
            if prev.offset + prev.size > offset {
                return true;
            }
        }
        if pos < self.extents.len() {
            let next = self.extents[pos];
            if offset + size > next.offset {
                return true;
            }
        }
        false
    }

    /// Allocates a block of `size` bytes at a caller-chosen `offset`.
    /// Fatal (corruption) if the result would overlap an existing extent,
    /// the reserve, or if `offset` is misaligned.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] on misalignment or overlap.
    pub fn alloc_at(&mut self, size: u64, offset: u64) -> Result<()> {
        if size == 0 {
            return Err(StoreError::Corruption("alloc_at: size must be > 0".into()));
        }
        if offset % self.alignment != 0 {
            return Err(StoreError::Corruption(format!(
                "alloc_at: offset {offset} is not a multiple of alignment {}",
                self.alignment
            )));
        }
        if offset < self.reserve_at_beginning {
            return Err(StoreError::Corruption(format!(
                "alloc_at: offset {offset} falls within the reserved region (< {})",
                self.reserve_at_beginning
            )));
        }
        if self.overlaps_any(offset, size) {
            return Err(StoreError::Corruption(format!(
                "alloc_at: extent [{offset}, {}) overlaps an existing extent",
                offset + size
            )));
        }
        let pos = self.find_insert_pos(offset);
        self.extents.insert(pos, Extent { offset, size });
        self.total_allocated += size;
        Ok(())
    }

    /// Allocates a block of `size` bytes wherever it fits first, searching
    /// the sorted extent list from the start (first-fit, not next-fit: we
    /// want allocations to compact toward the front of the file).
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if `size` is zero.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(StoreError::Corruption("alloc: size must be > 0".into()));
        }
        let aligned_size = align_up(size, self.alignment);
        let mut candidate = align_up(self.reserve_at_beginning, self.alignment);
        for extent in &self.extents {
            if candidate + aligned_size <= extent.offset {
                break;
            }
            candidate = align_up(extent.offset + extent.size, self.alignment);
        }
        let pos = self.find_insert_pos(candidate);
        self.extents.insert(pos, Extent { offset: candidate, size: aligned_size });
        self.total_allocated += aligned_size;
        Ok(candidate)
    }

    /// Bulk path used at file-open to reload the block table: sorts
    /// `pairs` by offset, then merges into the existing sorted array in a
    /// single linear pass.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if the merged result would
    /// overlap, i.e. the caller supplied bad input.
    pub fn alloc_many(&mut self, mut pairs: Vec<Extent>) -> Result<()> {
        pairs.sort_by_key(|e| e.offset);
        let merged = merge_blockpairs_into(&self.extents, &pairs)?;
        self.total_allocated = merged.iter().map(|e| e.size).sum();
        self.extents = merged;
        Ok(())
    }

    /// Frees the extent at `offset`.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if no extent is allocated there.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        match self.find_at(offset) {
            Some(idx) => {
                let extent = self.extents.remove(idx);
                self.total_allocated -= extent.size;
                Ok(())
            }
            None => Err(StoreError::Corruption(format!(
                "free: no extent allocated at offset {offset}"
            ))),
        }
    }

    /// Returns the size of the extent at `offset`.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if no extent is allocated there.
    pub fn size_at(&self, offset: u64) -> Result<u64> {
        self.find_at(offset)
            .map(|idx| self.extents[idx].size)
            .ok_or_else(|| StoreError::Corruption(format!("size_at: no extent at {offset}")))
    }

    /// Considers the blocks in sorted order; the reserved region at the
    /// beginning is block 0. Returns `(offset, size)` of block number `i`,
    /// or `None` if `i` is too large.
    #[must_use]
    pub fn nth_in_layout_order(&self, i: u64) -> Option<(u64, u64)> {
        if i == 0 {
            return Some((0, self.reserve_at_beginning));
        }
        let idx = usize::try_from(i - 1).ok()?;
        self.extents.get(idx).map(|e| (e.offset, e.size))
    }

    /// Returns the smallest address above every allocated extent: the
    /// "infinite" block used when the caller doesn't yet know how large
    /// the next write will be.
    #[must_use]
    pub fn allocated_limit(&self) -> u64 {
        self.extents.last().map_or(self.reserve_at_beginning, |e| e.offset + e.size)
    }

    /// Diagnostic report of how the file's address space is used.
    #[must_use]
    pub fn fragmentation_report(&self) -> FragmentationReport {
        let file_size_bytes = self.allocated_limit();
        let data_bytes = self.total_allocated;
        let mut unused_bytes = 0u64;
        let mut prev_end = self.reserve_at_beginning;
        for extent in &self.extents {
            unused_bytes += extent.offset.saturating_sub(prev_end);
            prev_end = extent.offset + extent.size;
        }
        FragmentationReport {
            file_size_bytes,
            data_bytes,
            unused_bytes,
            n_blocks: self.extents.len(),
        }
    }

    /// Checks internal invariants: sorted, non-overlapping, none within
    /// the reserve. Intended for tests and consistency checking, not hot
    /// paths.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut prev_end = self.reserve_at_beginning;
        for extent in &self.extents {
            if extent.offset < prev_end {
                return Err(StoreError::Corruption(format!(
                    "validate: extent at {} overlaps previous end {}",
                    extent.offset, prev_end
                )));
            }
            if extent.offset % self.alignment != 0 {
                return Err(StoreError::Corruption(format!(
                    "validate: extent at {} is misaligned",
                    extent.offset
                )));
            }
            if extent.size == 0 {
                return Err(StoreError::Corruption(format!(
                    "validate: extent at {} has zero size",
                    extent.offset
                )));
            }
            prev_end = extent.offset + extent.size;
        }
        Ok(())
    }

    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    #[must_use]
    pub fn reserve_at_beginning(&self) -> u64 {
        self.reserve_at_beginning
    }

    /// Snapshot of live extents in offset order, for persisting into the
    /// block table / manifest.
    #[must_use]
    pub fn live_extents(&self) -> &[Extent] {
        &self.extents
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    let rem = value % alignment;
    if rem == 0 { value } else { value + (alignment - rem) }
}

/// Merges two sorted, non-overlapping extent arrays into one sorted,
/// non-overlapping array. Kept as its own function, separate from
/// [`BlockAllocator::alloc_many`], so the merge logic can be exercised
/// directly by tests.
///
/// # Errors
/// Returns [`StoreError::Corruption`] if any extent from either input
/// overlaps another.
pub fn merge_blockpairs_into(dst: &[Extent], src: &[Extent]) -> Result<Vec<Extent>> {
    let mut merged = Vec::with_capacity(dst.len() + src.len());
    let (mut i, mut j) = (0usize, 0usize);
    while i < dst.len() || j < src.len() {
        let take_dst = match (dst.get(i), src.get(j)) {
            (Some(d), Some(s)) => d.offset <= s.offset,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => unreachable!(),
        };
        let next = if take_dst {
            i += 1;
            dst[i - 1]
        } else {
            j += 1;
            src[j - 1]
        };
        if let Some(last) = merged.last().copied() {
            let last: Extent = last;
            if next.offset < last.offset + last.size {
                return Err(StoreError::Corruption(format!(
                    "merge_blockpairs_into: extent at {} overlaps previous extent ending at {}",
                    next.offset,
                    last.offset + last.size
                )));
            }
        }
        merged.push(next);
    }
    Ok(merged)
}

#[derive(Debug, Clone, Copy)]
pub struct FragmentationReport {
    pub file_size_bytes: u64,
    pub data_bytes: u64,
    pub unused_bytes: u64,
    pub n_blocks: usize,
}
