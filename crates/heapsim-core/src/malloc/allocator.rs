//! Heap engine.
//!
//! Owns the arena, the top index (boundary between the chunk chain and
//! untouched arena space), the bins, and the active placement. Requests are
//! served from a free chunk chosen by the placement, splitting off any
//! remainder of at least one unit, or bump-allocated at the top index.
//! Releases coalesce with free physical neighbours immediately; a release next
//! to the top index hands the space back to the bump frontier instead of a bin.
//!
//! `allocate`/`release` report ordinary failure as `Ok(false)`. An `Err` means
//! a broken contract (a bad chunk index or an invalid placement candidate) and
//! the heap must not be used further.

use thiserror::Error;

use super::bins::{BinCollection, BinError, BinOccupancy};
use super::chunk::{self, Arena, ChunkError, HEADER_SIZE, MAX_ARENA_SIZE, UNIT};
use super::placement::{Placement, Strategy};
use crate::config::HeapConfig;

/// Contract violation inside the heap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Bin(#[from] BinError),
    #[error("placement returned invalid chunk {index}: {reason}")]
    InvalidCandidate { index: usize, reason: &'static str },
    #[error("heap capacity {capacity} exceeds the largest supported arena ({max} bytes)")]
    CapacityTooLarge { capacity: usize, max: usize },
}

/// A structural invariant that does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("chunk at {offset} spans {size} bytes, below one header plus one unit")]
    UndersizedChunk { offset: usize, size: usize },
    #[error("chunk at {offset} records prev_size {recorded}, expected {expected}")]
    PrevSizeMismatch {
        offset: usize,
        recorded: usize,
        expected: usize,
    },
    #[error("chunk chain ends at {end}, not at top index {top}")]
    ChainOverrun { top: usize, end: usize },
    #[error("adjacent free chunks at {first} and {second}")]
    AdjacentFree { first: usize, second: usize },
    #[error(
        "chain holds {free} free / {allocated} allocated chunks, heap tracks {tracked_free} / {tracked_allocated}"
    )]
    CountMismatch {
        free: usize,
        allocated: usize,
        tracked_free: usize,
        tracked_allocated: usize,
    },
    #[error("bin entry {offset} is not a free chunk")]
    StaleBinEntry { offset: usize },
    #[error("bin links around {offset} are inconsistent")]
    BrokenLink { offset: usize },
    #[error("bin entry {offset} breaks ascending address order")]
    BinOrder { offset: usize },
    #[error("free chunk at {offset} with unit size {unit_size} sits in the wrong bin")]
    MisfiledChunk { offset: usize, unit_size: usize },
    #[error("{expected} free chunks belong in bins but {linked} are linked")]
    UnlinkedFreeChunks { expected: usize, linked: usize },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Bin(#[from] BinError),
}

/// Heap lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl HeapLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: HeapLogLevel,
    /// Operation (`allocate`, `release`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `coalesce_prev`, `heap_stats`, ...).
    pub event: &'static str,
    /// Chunk offset involved in the event.
    pub offset: Option<usize>,
    /// Size as requested by the caller.
    pub size: Option<i64>,
    /// Unit size of the chunk or request involved.
    pub unit_size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: top index after the event.
    pub top_index: usize,
    /// Snapshot: free chunks in the chain.
    pub free_chunks: usize,
    /// Snapshot: allocated chunks in the chain.
    pub allocated_chunks: usize,
}

/// Header view of one chunk in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: usize,
    /// Header plus payload.
    pub size: usize,
    pub prev_size: usize,
    pub free: bool,
}

impl ChunkInfo {
    #[must_use]
    pub fn real_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }

    #[must_use]
    pub fn unit_size(&self) -> usize {
        chunk::floor_to_unit(self.real_size())
    }
}

/// Simulated heap over a fixed arena.
#[derive(Debug, Clone)]
pub struct Heap {
    arena: Arena,
    /// First byte past the chunk chain.
    top_index: usize,
    bins: BinCollection,
    placement: Placement,
    allocated_chunks: usize,
    free_chunks: usize,
    record_lifecycle: bool,
    next_decision_id: u64,
    lifecycle_logs: Vec<HeapLogRecord>,
}

impl Heap {
    /// Creates an empty heap of `capacity` bytes searched with `strategy`.
    pub fn new(capacity: usize, strategy: Strategy) -> Result<Self, HeapError> {
        Self::with_config(&HeapConfig {
            capacity,
            strategy,
            ..HeapConfig::default()
        })
    }

    pub fn with_config(config: &HeapConfig) -> Result<Self, HeapError> {
        if config.capacity > MAX_ARENA_SIZE {
            return Err(HeapError::CapacityTooLarge {
                capacity: config.capacity,
                max: MAX_ARENA_SIZE,
            });
        }
        Ok(Self {
            arena: Arena::new(config.capacity),
            top_index: 0,
            bins: BinCollection::new(config.strategy.bin_layout()),
            placement: Placement::new(config.strategy),
            allocated_chunks: 0,
            free_chunks: 0,
            record_lifecycle: config.record_lifecycle,
            next_decision_id: 1,
            lifecycle_logs: Vec::new(),
        })
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        offset: Option<usize>,
        size: Option<i64>,
        unit_size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.record_lifecycle {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("core::heap::{}::{:016x}", symbol, decision_id);
        self.lifecycle_logs.push(HeapLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            offset,
            size,
            unit_size,
            outcome,
            details: details.into(),
            top_index: self.top_index,
            free_chunks: self.free_chunks,
            allocated_chunks: self.allocated_chunks,
        });
    }

    fn record_heap_stats(&mut self, symbol: &'static str) {
        let details = format!(
            "top_index={};capacity={};strategy={}",
            self.top_index,
            self.arena.len(),
            self.strategy()
        );
        self.record_lifecycle(
            HeapLogLevel::Debug,
            symbol,
            "heap_stats",
            None,
            None,
            None,
            "snapshot",
            details,
        );
    }

    /// Allocates a chunk for `size` bytes.
    ///
    /// Returns `Ok(false)` for non-positive sizes and when neither a free chunk
    /// nor the space above the top index can hold the request.
    pub fn allocate(&mut self, size: i64) -> Result<bool, HeapError> {
        if size <= 0 {
            self.record_lifecycle(
                HeapLogLevel::Trace,
                "allocate",
                "alloc_rejected",
                None,
                Some(size),
                None,
                "rejected",
                "non_positive_size",
            );
            return Ok(false);
        }

        let Some(unit_size) = usize::try_from(size).ok().and_then(chunk::ceil_to_unit) else {
            self.record_lifecycle(
                HeapLogLevel::Info,
                "allocate",
                "bump_exhausted",
                None,
                Some(size),
                None,
                "oom",
                "size_overflows_arena",
            );
            self.record_heap_stats("allocate");
            return Ok(false);
        };

        let candidate = if self.bins.is_supported(unit_size) {
            self.placement
                .find_candidate(unit_size, &self.bins, &self.arena, self.top_index)?
        } else {
            None
        };

        let allocated = match candidate {
            Some(index) => {
                self.validate_candidate(index, unit_size, size)?;
                self.allocate_free_chunk(index, unit_size, size)?;
                true
            }
            None => self.bump_allocate(unit_size, size)?,
        };
        self.record_heap_stats("allocate");
        Ok(allocated)
    }

    /// Releases the lowest-addressed allocated chunk whose unit size equals
    /// `size` rounded up to the unit.
    ///
    /// Returns `Ok(false)` for non-positive sizes, an empty heap, or when no
    /// allocated chunk has that unit size.
    pub fn release(&mut self, size: i64) -> Result<bool, HeapError> {
        if size <= 0 || self.top_index == 0 {
            self.record_lifecycle(
                HeapLogLevel::Trace,
                "release",
                "free_rejected",
                None,
                Some(size),
                None,
                "rejected",
                if size <= 0 {
                    "non_positive_size"
                } else {
                    "empty_heap"
                },
            );
            return Ok(false);
        }

        let unit_size = usize::try_from(size).ok().and_then(chunk::ceil_to_unit);
        let found = match unit_size {
            Some(unit_size) => self.find_allocated(unit_size)?,
            None => None,
        };
        let Some(index) = found else {
            self.record_lifecycle(
                HeapLogLevel::Info,
                "release",
                "free_no_match",
                None,
                Some(size),
                unit_size,
                "no_match",
                "no_allocated_chunk_of_unit_size",
            );
            self.record_heap_stats("release");
            return Ok(false);
        };

        self.coalesce(index, size)?;
        self.record_heap_stats("release");
        Ok(true)
    }

    fn validate_candidate(
        &mut self,
        index: usize,
        unit_size: usize,
        size: i64,
    ) -> Result<(), HeapError> {
        let reason = if index >= self.top_index {
            Some("beyond top index")
        } else if !self.arena.is_free(index)? {
            Some("chunk is not free")
        } else if self.arena.unit_size(index)? < unit_size {
            Some("chunk is too small")
        } else if self.arena.next_chunk_index(index)? > self.top_index {
            Some("chunk overruns top index")
        } else {
            None
        };

        if let Some(reason) = reason {
            self.record_lifecycle(
                HeapLogLevel::Error,
                "allocate",
                "invalid_candidate",
                Some(index),
                Some(size),
                Some(unit_size),
                "fatal",
                reason,
            );
            return Err(HeapError::InvalidCandidate { index, reason });
        }
        Ok(())
    }

    fn allocate_free_chunk(
        &mut self,
        index: usize,
        unit_size: usize,
        size: i64,
    ) -> Result<(), HeapError> {
        let free_unit = self.arena.unit_size(index)?;
        self.bins.unlink(&mut self.arena, index, free_unit)?;
        self.free_chunks -= 1;
        self.allocated_chunks += 1;

        let real_size = self.arena.real_size(index)?;
        self.arena.set_free(index, false)?;

        let remainder = real_size
            .checked_sub(unit_size + HEADER_SIZE)
            .filter(|remainder| *remainder >= UNIT);
        match remainder {
            Some(remainder) => {
                self.arena.set_real_size(index, unit_size)?;
                let remainder_index = self.arena.next_chunk_index(index)?;
                self.arena.set_prev_real_size(remainder_index, unit_size)?;
                self.mark_free(remainder_index, remainder)?;
                let after = self.arena.next_chunk_index(remainder_index)?;
                if self.arena.can_record_prev_size(after) {
                    self.arena.set_prev_real_size(after, remainder)?;
                }
                self.record_lifecycle(
                    HeapLogLevel::Trace,
                    "allocate",
                    "alloc",
                    Some(index),
                    Some(size),
                    Some(unit_size),
                    "success",
                    format!("path=bin_split remainder_offset={remainder_index} remainder={remainder}"),
                );
            }
            None => {
                self.record_lifecycle(
                    HeapLogLevel::Trace,
                    "allocate",
                    "alloc",
                    Some(index),
                    Some(size),
                    Some(unit_size),
                    "success",
                    format!(
                        "path=bin_whole internal_fragmentation={}",
                        real_size - unit_size
                    ),
                );
            }
        }
        Ok(())
    }

    fn bump_allocate(&mut self, unit_size: usize, size: i64) -> Result<bool, HeapError> {
        if !self.arena.has_enough_space(self.top_index, unit_size)? {
            let details = format!("top_index={} capacity={}", self.top_index, self.arena.len());
            self.record_lifecycle(
                HeapLogLevel::Info,
                "allocate",
                "bump_exhausted",
                None,
                Some(size),
                Some(unit_size),
                "oom",
                details,
            );
            return Ok(false);
        }

        let index = self.top_index;
        self.arena.set_free(index, false)?;
        self.arena.set_real_size(index, unit_size)?;
        self.top_index = self.arena.next_chunk_index(index)?;
        // The chunk that will next be carved at the top needs to know its predecessor.
        if self.arena.can_record_prev_size(self.top_index) {
            self.arena.set_prev_real_size(self.top_index, unit_size)?;
        }
        self.allocated_chunks += 1;

        self.record_lifecycle(
            HeapLogLevel::Trace,
            "allocate",
            "alloc",
            Some(index),
            Some(size),
            Some(unit_size),
            "success",
            "path=bump",
        );
        Ok(true)
    }

    fn find_allocated(&self, unit_size: usize) -> Result<Option<usize>, ChunkError> {
        let mut index = 0;
        while index < self.top_index {
            if !self.arena.is_free(index)? && self.arena.unit_size(index)? == unit_size {
                return Ok(Some(index));
            }
            index = self.arena.next_chunk_index(index)?;
        }
        Ok(None)
    }

    fn coalesce(&mut self, index: usize, size: i64) -> Result<(), HeapError> {
        let mut start = index;
        let mut real_size = self.arena.real_size(index)?;
        self.arena.set_free(index, true)?;
        self.allocated_chunks -= 1;

        if let Some(prev) = self.arena.prev_chunk_index(index)?
            && self.arena.is_free(prev)?
        {
            let prev_unit = self.arena.unit_size(prev)?;
            self.bins.unlink(&mut self.arena, prev, prev_unit)?;
            self.free_chunks -= 1;
            real_size += self.arena.real_size(prev)? + HEADER_SIZE;
            start = prev;
            self.record_lifecycle(
                HeapLogLevel::Trace,
                "release",
                "coalesce_prev",
                Some(prev),
                Some(size),
                Some(prev_unit),
                "merged",
                format!("released_offset={index}"),
            );
        }

        let next = self.arena.next_chunk_index(index)?;
        if next == self.top_index {
            self.top_index = start;
            if start == 0 {
                self.arena.clear_prev_size(0)?;
            }
            self.record_lifecycle(
                HeapLogLevel::Trace,
                "release",
                "retreat_top",
                Some(start),
                Some(size),
                Some(chunk::floor_to_unit(real_size)),
                "success",
                format!("released_offset={index} top_index={start}"),
            );
            return Ok(());
        }

        if self.arena.is_free(next)? {
            let next_unit = self.arena.unit_size(next)?;
            self.bins.unlink(&mut self.arena, next, next_unit)?;
            self.free_chunks -= 1;
            real_size += self.arena.real_size(next)? + HEADER_SIZE;
            self.record_lifecycle(
                HeapLogLevel::Trace,
                "release",
                "coalesce_next",
                Some(next),
                Some(size),
                Some(next_unit),
                "merged",
                format!("released_offset={index}"),
            );
        }

        self.mark_free(start, real_size)?;
        let after = self.arena.next_chunk_index(start)?;
        if self.arena.can_record_prev_size(after) {
            self.arena.set_prev_real_size(after, real_size)?;
        }
        self.record_lifecycle(
            HeapLogLevel::Trace,
            "release",
            "free",
            Some(start),
            Some(size),
            Some(chunk::floor_to_unit(real_size)),
            "success",
            format!("released_offset={index} real_size={real_size}"),
        );
        Ok(())
    }

    /// Turns `index` into a free chunk of `real_size` payload and links it.
    fn mark_free(&mut self, index: usize, real_size: usize) -> Result<(), HeapError> {
        self.arena.set_free(index, true)?;
        self.arena.set_real_size(index, real_size)?;
        self.free_chunks += 1;

        let unit_size = chunk::floor_to_unit(real_size);
        if !self.bins.link(&mut self.arena, index, unit_size)? {
            self.record_lifecycle(
                HeapLogLevel::Debug,
                "release",
                "unbinned_free_chunk",
                Some(index),
                None,
                Some(unit_size),
                "unlinked",
                "unit_size_beyond_tracked_classes",
            );
        }
        Ok(())
    }

    /// Offset separating the chunk chain from untouched arena space.
    #[must_use]
    pub fn top_index(&self) -> usize {
        self.top_index
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.placement.strategy()
    }

    #[must_use]
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[must_use]
    pub fn bins(&self) -> &BinCollection {
        &self.bins
    }

    #[must_use]
    pub fn allocated_chunk_count(&self) -> usize {
        self.allocated_chunks
    }

    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        self.free_chunks
    }

    /// Offsets of allocated chunks in ascending order. The top index closes the listing.
    pub fn allocated_chunk_offsets(&self) -> Result<Vec<usize>, HeapError> {
        Ok(self
            .chunks()?
            .into_iter()
            .filter(|chunk| !chunk.free)
            .map(|chunk| chunk.offset)
            .collect())
    }

    /// Free-chunk counts of the non-empty size classes.
    pub fn bin_occupancy(&self) -> Result<Vec<BinOccupancy>, HeapError> {
        Ok(self.bins.occupancy(&self.arena)?)
    }

    /// Headers of every chunk from offset 0 up to the top index.
    pub fn chunks(&self) -> Result<Vec<ChunkInfo>, HeapError> {
        let mut out = Vec::with_capacity(self.allocated_chunks + self.free_chunks);
        let mut offset = 0;
        while offset < self.top_index {
            let size = self.arena.size(offset)?;
            out.push(ChunkInfo {
                offset,
                size,
                prev_size: self.arena.prev_size(offset)?,
                free: self.arena.is_free(offset)?,
            });
            offset += size;
        }
        Ok(out)
    }

    /// Verifies chain contiguity, header sizes, coalescing, and bin linkage/order.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut offset = 0;
        let mut expected_prev = 0;
        let mut prev_free = None;
        let mut free = 0;
        let mut allocated = 0;
        let mut binnable = 0;

        while offset < self.top_index {
            let size = self.arena.size(offset)?;
            if size < HEADER_SIZE + UNIT {
                return Err(InvariantViolation::UndersizedChunk { offset, size });
            }
            let recorded = self.arena.prev_size(offset)?;
            if recorded != expected_prev {
                return Err(InvariantViolation::PrevSizeMismatch {
                    offset,
                    recorded,
                    expected: expected_prev,
                });
            }
            if self.arena.is_free(offset)? {
                if let Some(first) = prev_free {
                    return Err(InvariantViolation::AdjacentFree {
                        first,
                        second: offset,
                    });
                }
                free += 1;
                if self.bins.is_supported(self.arena.unit_size(offset)?) {
                    binnable += 1;
                }
                prev_free = Some(offset);
            } else {
                allocated += 1;
                prev_free = None;
            }
            expected_prev = size;
            offset += size;
        }

        if offset != self.top_index {
            return Err(InvariantViolation::ChainOverrun {
                top: self.top_index,
                end: offset,
            });
        }
        if self.arena.can_record_prev_size(self.top_index) {
            let recorded = self.arena.prev_size(self.top_index)?;
            if recorded != expected_prev {
                return Err(InvariantViolation::PrevSizeMismatch {
                    offset: self.top_index,
                    recorded,
                    expected: expected_prev,
                });
            }
        }
        if free != self.free_chunks || allocated != self.allocated_chunks {
            return Err(InvariantViolation::CountMismatch {
                free,
                allocated,
                tracked_free: self.free_chunks,
                tracked_allocated: self.allocated_chunks,
            });
        }

        let mut linked = 0;
        for (slot, head) in self.bins.heads().enumerate() {
            let Some(head) = head else { continue };
            let mut at = head;
            loop {
                if at >= self.top_index || !self.arena.is_free(at)? {
                    return Err(InvariantViolation::StaleBinEntry { offset: at });
                }
                let unit_size = self.arena.unit_size(at)?;
                if self.bins.class_slot(unit_size) != Some(slot) {
                    return Err(InvariantViolation::MisfiledChunk {
                        offset: at,
                        unit_size,
                    });
                }
                let forward = self.arena.forward_free_index(at)?;
                if self.arena.backward_free_index(forward)? != at {
                    return Err(InvariantViolation::BrokenLink { offset: at });
                }
                linked += 1;
                if linked > free {
                    return Err(InvariantViolation::BrokenLink { offset: at });
                }
                if forward == head {
                    break;
                }
                if forward <= at {
                    return Err(InvariantViolation::BinOrder { offset: forward });
                }
                at = forward;
            }
        }
        if linked != binnable {
            return Err(InvariantViolation::UnlinkedFreeChunks {
                expected: binnable,
                linked,
            });
        }
        Ok(())
    }

    /// Enables or disables lifecycle recording.
    pub fn set_lifecycle_recording(&mut self, enabled: bool) {
        self.record_lifecycle = enabled;
    }

    /// Returns a view of heap lifecycle log records.
    #[must_use]
    pub fn lifecycle_logs(&self) -> &[HeapLogRecord] {
        &self.lifecycle_logs
    }

    /// Drains heap lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<HeapLogRecord> {
        std::mem::take(&mut self.lifecycle_logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::bins::MAX_BIN_UNIT_SIZE;

    fn heap(strategy: Strategy) -> Heap {
        Heap::new(512, strategy).unwrap()
    }

    fn occupancy(heap: &Heap) -> Vec<(String, usize)> {
        heap.bin_occupancy()
            .unwrap()
            .into_iter()
            .map(|bin| (bin.label(), bin.free_chunks))
            .collect()
    }

    #[test]
    fn test_new_heap() {
        let heap = heap(Strategy::FirstFit);
        assert_eq!(heap.top_index(), 0);
        assert_eq!(heap.capacity(), 512);
        assert_eq!(heap.strategy(), Strategy::FirstFit);
        assert!(heap.allocated_chunk_offsets().unwrap().is_empty());
        assert!(heap.bin_occupancy().unwrap().is_empty());
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_capacity_too_large() {
        let err = Heap::new(MAX_ARENA_SIZE + 1, Strategy::FirstFit).unwrap_err();
        assert!(matches!(err, HeapError::CapacityTooLarge { .. }));
    }

    #[test]
    fn test_zero_capacity_heap_never_allocates() {
        let mut heap = Heap::new(0, Strategy::BestFit).unwrap();
        assert!(!heap.allocate(1).unwrap());
        assert!(!heap.release(1).unwrap());
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_bump_allocation_moves_top() {
        let mut heap = heap(Strategy::FirstFit);
        assert!(heap.allocate(8).unwrap());
        assert_eq!(heap.top_index(), 17);
        assert!(heap.allocate(16).unwrap());
        assert_eq!(heap.top_index(), 42);
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![0, 17]);
        assert_eq!(heap.arena().prev_size(17).unwrap(), 17);
        assert_eq!(heap.arena().prev_size(42).unwrap(), 25);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_requests_round_up_to_unit() {
        let mut heap = heap(Strategy::FirstFit);
        assert!(heap.allocate(1).unwrap());
        assert_eq!(heap.top_index(), 17);
        assert!(heap.allocate(9).unwrap());
        assert_eq!(heap.top_index(), 17 + 25);
    }

    #[test]
    fn test_non_positive_sizes_are_rejected() {
        let mut heap = heap(Strategy::FirstFit);
        assert!(heap.allocate(8).unwrap());
        for size in [0, -5, i64::MIN] {
            assert!(!heap.allocate(size).unwrap());
            assert!(!heap.release(size).unwrap());
        }
        assert_eq!(heap.top_index(), 17);
        assert_eq!(heap.allocated_chunk_count(), 1);
    }

    #[test]
    fn test_release_on_empty_heap_fails() {
        let mut heap = heap(Strategy::FirstFit);
        assert!(!heap.release(8).unwrap());
    }

    #[test]
    fn test_release_without_match_fails() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(8).unwrap();
        heap.allocate(24).unwrap();
        assert!(!heap.release(16).unwrap());
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![0, 17]);
    }

    #[test]
    fn test_release_picks_lowest_address_match() {
        let mut heap = heap(Strategy::FirstFit);
        for _ in 0..3 {
            heap.allocate(16).unwrap();
        }
        assert!(heap.release(16).unwrap());
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![25, 50]);
    }

    #[test]
    fn test_release_without_merge_fills_bin() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(8).unwrap();
        heap.allocate(16).unwrap();
        assert!(heap.release(8).unwrap());
        assert_eq!(occupancy(&heap), vec![("bin1".to_string(), 1)]);
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![17]);
        assert_eq!(heap.top_index(), 42);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_releasing_only_chunk_empties_heap() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(40).unwrap();
        assert!(heap.release(40).unwrap());
        assert_eq!(heap.top_index(), 0);
        assert_eq!(heap.arena().prev_size(0).unwrap(), 0);
        assert!(heap.bin_occupancy().unwrap().is_empty());
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_release_merges_into_top_through_free_predecessor() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(8).unwrap();
        heap.allocate(16).unwrap();
        heap.allocate(24).unwrap();
        heap.release(16).unwrap();
        assert_eq!(occupancy(&heap), vec![("bin2".to_string(), 1)]);

        heap.release(24).unwrap();
        assert_eq!(heap.top_index(), 17);
        assert!(heap.bin_occupancy().unwrap().is_empty());
        assert_eq!(heap.free_chunk_count(), 0);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_release_merges_both_neighbours() {
        let mut heap = heap(Strategy::FirstFit);
        for size in [8, 16, 24, 8] {
            heap.allocate(size).unwrap();
        }
        heap.release(8).unwrap(); // chunk 0
        heap.release(24).unwrap(); // chunk 42
        assert_eq!(
            occupancy(&heap),
            vec![("bin1".to_string(), 1), ("bin3".to_string(), 1)]
        );

        heap.release(16).unwrap(); // chunk 17 joins both
        let chunks = heap.chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].free);
        assert_eq!(chunks[0].size, 17 + 25 + 33);
        assert_eq!(chunks[1].prev_size, 75);
        assert_eq!(occupancy(&heap), vec![("bin8".to_string(), 1)]);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_split_leaves_free_remainder() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(64).unwrap();
        heap.allocate(8).unwrap();
        heap.release(64).unwrap();

        assert!(heap.allocate(16).unwrap());
        let chunks = heap.chunks().unwrap();
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].real_size(), 16);
        assert!(!chunks[0].free);
        assert_eq!(chunks[1].offset, 25);
        assert_eq!(chunks[1].real_size(), 64 - 16 - HEADER_SIZE);
        assert!(chunks[1].free);
        assert_eq!(chunks[2].prev_size, chunks[1].size);
        assert_eq!(occupancy(&heap), vec![("bin4".to_string(), 1)]);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_small_remainder_stays_as_internal_fragmentation() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(24).unwrap();
        heap.allocate(8).unwrap();
        heap.release(24).unwrap();

        // 24 - 16 - 9 leaves no room for another chunk.
        assert!(heap.allocate(16).unwrap());
        let chunks = heap.chunks().unwrap();
        assert_eq!(chunks[0].real_size(), 24);
        assert!(!chunks[0].free);
        assert_eq!(heap.top_index(), 33 + 17);
        heap.check_invariants().unwrap();

        // The chunk now answers to its full unit size, not the request.
        assert!(!heap.release(16).unwrap());
        assert!(heap.release(24).unwrap());
    }

    #[test]
    fn test_allocate_then_release_restores_state() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(64).unwrap();
        heap.allocate(8).unwrap();
        heap.release(64).unwrap();

        let before_bins = occupancy(&heap);
        let before_offsets = heap.allocated_chunk_offsets().unwrap();
        let before_top = heap.top_index();

        heap.allocate(16).unwrap();
        heap.release(16).unwrap();

        assert_eq!(occupancy(&heap), before_bins);
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), before_offsets);
        assert_eq!(heap.top_index(), before_top);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_oversized_requests_bypass_bins() {
        let mut heap = Heap::new(4096, Strategy::FirstFit).unwrap();
        let big = (MAX_BIN_UNIT_SIZE + UNIT) as i64;
        heap.allocate(big).unwrap();
        heap.allocate(8).unwrap();
        assert!(heap.release(big).unwrap());

        // Free but unbinned: invisible to occupancy and to the strategy.
        assert_eq!(heap.free_chunk_count(), 1);
        assert!(heap.bin_occupancy().unwrap().is_empty());
        heap.check_invariants().unwrap();

        let top = heap.top_index();
        assert!(heap.allocate(big).unwrap());
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![529, top]);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_exhaustion_is_plain_failure() {
        let mut heap = Heap::new(50, Strategy::WorstFit).unwrap();
        assert!(heap.allocate(8).unwrap());
        assert!(heap.allocate(8).unwrap());
        assert_eq!(heap.top_index(), 34);
        assert!(!heap.allocate(8).unwrap());
        assert_eq!(heap.allocated_chunk_offsets().unwrap(), vec![0, 17]);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_arena_filled_to_last_byte() {
        // 30 chunks of 17 bytes end at 510, too close to the end for another header.
        let mut heap = heap(Strategy::FirstFit);
        for _ in 0..30 {
            assert!(heap.allocate(8).unwrap());
        }
        assert_eq!(heap.top_index(), 510);
        assert!(!heap.allocate(1).unwrap());
        heap.check_invariants().unwrap();
        assert!(heap.release(8).unwrap());
        assert!(heap.allocate(8).unwrap());
        assert_eq!(heap.allocated_chunk_count(), 30);
    }

    #[test]
    fn test_huge_request_fails_without_panicking() {
        let mut heap = heap(Strategy::NextFit);
        assert!(!heap.allocate(i64::MAX).unwrap());
        assert!(heap.allocate(8).unwrap());
        assert!(!heap.release(i64::MAX).unwrap());
    }

    #[test]
    fn test_invalid_candidate_is_fatal() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(16).unwrap();
        heap.allocate(8).unwrap();
        heap.release(16).unwrap();

        // Corrupt the free flag behind the bins' back.
        heap.arena.set_free(0, false).unwrap();
        let err = heap.allocate(16).unwrap_err();
        assert_eq!(
            err,
            HeapError::InvalidCandidate {
                index: 0,
                reason: "chunk is not free"
            }
        );
        let logs = heap.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == HeapLogLevel::Error && entry.event == "invalid_candidate"
        }));
    }

    #[test]
    fn test_check_invariants_detects_corruption() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(8).unwrap();
        heap.allocate(8).unwrap();
        heap.arena.set_prev_real_size(17, 16).unwrap();
        assert_eq!(
            heap.check_invariants(),
            Err(InvariantViolation::PrevSizeMismatch {
                offset: 17,
                recorded: 25,
                expected: 17,
            })
        );
    }

    #[test]
    fn test_next_fit_uses_unified_list() {
        let mut heap = Heap::new(2048, Strategy::NextFit).unwrap();
        let big = (MAX_BIN_UNIT_SIZE + UNIT) as i64;
        heap.allocate(big).unwrap();
        heap.allocate(8).unwrap();
        heap.release(big).unwrap();
        heap.check_invariants().unwrap();

        // The oversized free chunk is reachable for next-fit.
        let top = heap.top_index();
        assert!(heap.allocate(16).unwrap());
        assert_eq!(heap.top_index(), top);
        assert_eq!(heap.allocated_chunk_offsets().unwrap()[0], 0);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_lifecycle_logs_include_trace_and_decision_ids() {
        let mut heap = heap(Strategy::FirstFit);
        heap.allocate(64).unwrap();
        heap.release(64).unwrap();

        let logs = heap.drain_lifecycle_logs();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::heap::"))
        );
        assert!(logs.iter().any(|entry| {
            entry.level == HeapLogLevel::Trace && entry.symbol == "allocate" && entry.event == "alloc"
        }));
        assert!(
            logs.iter()
                .any(|entry| entry.event == "retreat_top" && entry.top_index == 0)
        );
        assert!(
            logs.iter()
                .any(|entry| entry.level == HeapLogLevel::Debug && entry.event == "heap_stats")
        );
        assert!(heap.lifecycle_logs().is_empty());
    }

    #[test]
    fn test_lifecycle_logs_info_for_exhaustion_and_no_match() {
        let mut heap = Heap::new(20, Strategy::FirstFit).unwrap();
        heap.allocate(8).unwrap();
        assert!(!heap.allocate(8).unwrap());
        assert!(!heap.release(16).unwrap());

        let logs = heap.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == HeapLogLevel::Info && entry.event == "bump_exhausted"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == HeapLogLevel::Info && entry.event == "free_no_match"
        }));
    }

    #[test]
    fn test_lifecycle_recording_can_be_disabled() {
        let mut heap = Heap::with_config(&HeapConfig {
            record_lifecycle: false,
            ..HeapConfig::default()
        })
        .unwrap();
        heap.allocate(8).unwrap();
        heap.release(8).unwrap();
        assert!(heap.lifecycle_logs().is_empty());
    }
}
