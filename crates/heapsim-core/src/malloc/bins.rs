//! Free-list bins.
//!
//! Each bin holds the free chunks of one exact unit size as a circular
//! doubly-linked list threaded through the chunks' own payload bytes. The list
//! head is always the lowest-addressed member and the members ascend from
//! there, so walking `forward` from the head visits free chunks in address
//! order.
//!
//! Two layouts exist:
//! - [`BinLayout::Segregated`]: [`SMALL_BIN_COUNT`] size classes of one unit
//!   each, covering unit sizes `UNIT..=MAX_BIN_UNIT_SIZE`. Larger free chunks
//!   stay unlinked.
//! - [`BinLayout::Unified`]: a single address-ordered list holding every free
//!   chunk regardless of size (used by next-fit).

use thiserror::Error;

use super::chunk::{Arena, ChunkError, UNIT};

/// Number of discretely tracked size classes.
pub const SMALL_BIN_COUNT: usize = 64;

/// Largest unit size a segregated bin tracks.
pub const MAX_BIN_UNIT_SIZE: usize = SMALL_BIN_COUNT * UNIT;

/// Bin accessor misuse or a failed chunk access while walking a list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinError {
    #[error("chunk size {unit_size} is out of supported size ({min} - {max})")]
    UnsupportedSize {
        unit_size: usize,
        min: usize,
        max: usize,
    },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinLayout {
    Segregated,
    Unified,
}

/// Free-chunk count of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinOccupancy {
    /// 1-based class number (`unit_size / UNIT`).
    pub class: usize,
    pub unit_size: usize,
    pub free_chunks: usize,
}

impl BinOccupancy {
    /// Human-readable class label, e.g. `bin3`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("bin{}", self.class)
    }
}

#[derive(Debug, Clone)]
pub struct BinCollection {
    layout: BinLayout,
    heads: Vec<Option<usize>>,
}

impl BinCollection {
    #[must_use]
    pub fn new(layout: BinLayout) -> Self {
        let slots = match layout {
            BinLayout::Segregated => SMALL_BIN_COUNT,
            BinLayout::Unified => 1,
        };
        Self {
            layout,
            heads: vec![None; slots],
        }
    }

    #[must_use]
    pub fn layout(&self) -> BinLayout {
        self.layout
    }

    /// Whether chunks of `unit_size` are tracked by a bin. Never fails.
    #[must_use]
    pub fn is_supported(&self, unit_size: usize) -> bool {
        self.slot(unit_size).is_some()
    }

    /// Head of the bin for `unit_size`.
    pub fn head(&self, unit_size: usize) -> Result<Option<usize>, BinError> {
        Ok(self.heads[self.checked_slot(unit_size)?])
    }

    pub fn set_head(&mut self, unit_size: usize, head: Option<usize>) -> Result<(), BinError> {
        let slot = self.checked_slot(unit_size)?;
        self.heads[slot] = head;
        Ok(())
    }

    /// Heads in ascending class order, empty bins included.
    pub fn heads(&self) -> impl DoubleEndedIterator<Item = Option<usize>> + '_ {
        self.heads.iter().copied()
    }

    /// Class slot of `unit_size` (0-based), `None` when the size is untracked.
    #[must_use]
    pub fn class_slot(&self, unit_size: usize) -> Option<usize> {
        self.slot(unit_size)
    }

    /// Number of free chunks of exactly `unit_size` held by the bins.
    ///
    /// For the unified layout the single list is walked and only members of
    /// that unit size are counted.
    pub fn count_free(&self, unit_size: usize, arena: &Arena) -> Result<usize, BinError> {
        let Some(head) = self.head(unit_size)? else {
            return Ok(0);
        };
        let matches = |index: usize| -> Result<bool, BinError> {
            Ok(match self.layout {
                BinLayout::Segregated => true,
                BinLayout::Unified => arena.unit_size(index)? == unit_size,
            })
        };

        let mut count = usize::from(matches(head)?);
        let mut index = arena.forward_free_index(head)?;
        while index != head {
            count += usize::from(matches(index)?);
            index = arena.forward_free_index(index)?;
        }
        Ok(count)
    }

    /// Non-empty classes in ascending order.
    pub fn occupancy(&self, arena: &Arena) -> Result<Vec<BinOccupancy>, BinError> {
        let mut out = Vec::new();
        for class in 1..=SMALL_BIN_COUNT {
            let unit_size = class * UNIT;
            let free_chunks = self.count_free(unit_size, arena)?;
            if free_chunks > 0 {
                out.push(BinOccupancy {
                    class,
                    unit_size,
                    free_chunks,
                });
            }
        }
        Ok(out)
    }

    /// Links the free chunk at `index` into its bin, keeping address order.
    ///
    /// Returns `false` when `unit_size` is untracked and the chunk stays unlinked.
    pub fn link(
        &mut self,
        arena: &mut Arena,
        index: usize,
        unit_size: usize,
    ) -> Result<bool, BinError> {
        let Some(slot) = self.slot(unit_size) else {
            return Ok(false);
        };

        let Some(head) = self.heads[slot] else {
            arena.set_forward_free_index(index, index)?;
            arena.set_backward_free_index(index, index)?;
            self.heads[slot] = Some(index);
            return Ok(true);
        };

        let tail = arena.backward_free_index(head)?;
        let next = if index < head || index > tail {
            // Either end of the ring: splice between tail and head.
            head
        } else if index - head <= tail - index {
            let mut at = arena.forward_free_index(head)?;
            while at < index {
                at = arena.forward_free_index(at)?;
            }
            at
        } else {
            let mut at = tail;
            while at > index {
                at = arena.backward_free_index(at)?;
            }
            arena.forward_free_index(at)?
        };
        let prev = arena.backward_free_index(next)?;

        arena.set_forward_free_index(prev, index)?;
        arena.set_backward_free_index(next, index)?;
        arena.set_backward_free_index(index, prev)?;
        arena.set_forward_free_index(index, next)?;

        if index < head {
            self.heads[slot] = Some(index);
        }
        Ok(true)
    }

    /// Unlinks the chunk at `index` from the bin it was linked into as `unit_size`.
    pub fn unlink(
        &mut self,
        arena: &mut Arena,
        index: usize,
        unit_size: usize,
    ) -> Result<(), BinError> {
        let Some(slot) = self.slot(unit_size) else {
            return Ok(());
        };

        let prev = arena.backward_free_index(index)?;
        if prev == index {
            if self.heads[slot] == Some(index) {
                self.heads[slot] = None;
            }
            return Ok(());
        }

        let next = arena.forward_free_index(index)?;
        if self.heads[slot] == Some(index) {
            self.heads[slot] = Some(next);
        }
        arena.set_forward_free_index(prev, next)?;
        arena.set_backward_free_index(next, prev)?;
        Ok(())
    }

    /// Members of the bin for `unit_size`, walked forward from the head.
    pub fn members(&self, unit_size: usize, arena: &Arena) -> Result<Vec<usize>, BinError> {
        let mut out = Vec::new();
        let Some(head) = self.head(unit_size)? else {
            return Ok(out);
        };
        out.push(head);
        let mut index = arena.forward_free_index(head)?;
        while index != head {
            out.push(index);
            index = arena.forward_free_index(index)?;
        }
        Ok(out)
    }

    fn slot(&self, unit_size: usize) -> Option<usize> {
        match self.layout {
            BinLayout::Segregated => (unit_size / UNIT)
                .checked_sub(1)
                .filter(|slot| *slot < SMALL_BIN_COUNT),
            BinLayout::Unified => Some(0),
        }
    }

    fn checked_slot(&self, unit_size: usize) -> Result<usize, BinError> {
        self.slot(unit_size).ok_or(BinError::UnsupportedSize {
            unit_size,
            min: UNIT,
            max: MAX_BIN_UNIT_SIZE,
        })
    }
}
