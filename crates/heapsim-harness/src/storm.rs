//! Deterministic fragmentation storms.
//!
//! Each storm drives a heap through a seeded alloc/free workload and samples
//! fragmentation after every operation, so placement strategies can be compared
//! on identical request streams. Structural invariants are checked after every
//! step; a violation aborts the storm.

use heapsim_core::malloc::{Heap, InvariantViolation};
use heapsim_core::{HeapConfig, HeapError, Strategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::report::Fragmentation;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // xorshift has a fixed point at zero
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        debug_assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StormKind {
    /// Grow until the arena refuses, then drain from the lowest address.
    Sawtooth,
    /// Random interleaving of small/medium allocations and releases.
    RandomChurn,
    /// Alternating small and large classes, releasing only the small ones.
    SizeClassThrash,
    /// Fill the arena, punch holes in every other chunk, refill with larger requests.
    Exhaustion,
}

impl StormKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sawtooth => "sawtooth",
            Self::RandomChurn => "random_churn",
            Self::SizeClassThrash => "size_class_thrash",
            Self::Exhaustion => "exhaustion",
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 4] {
        [
            Self::Sawtooth,
            Self::RandomChurn,
            Self::SizeClassThrash,
            Self::Exhaustion,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StormConfig {
    pub seed: u64,
    /// Operations per storm (allocations and releases, successful or not).
    pub steps: usize,
    pub capacity: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            steps: 2_000,
            capacity: 4096,
        }
    }
}

#[derive(Debug, Error)]
pub enum StormError {
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("{storm} under {strategy} broke an invariant at step {step}: {violation}")]
    Invariant {
        storm: &'static str,
        strategy: Strategy,
        step: usize,
        violation: InvariantViolation,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StormMetrics {
    pub storm: String,
    pub strategy: String,
    pub seed: u64,
    pub ops: usize,
    pub alloc_attempts: usize,
    pub alloc_failures: usize,
    pub releases: usize,
    pub peak_top_index: usize,
    pub final_top_index: usize,
    pub peak_free_chunks: usize,
    pub mean_external_fragmentation_permille: f64,
    pub final_fragmentation: Fragmentation,
}

impl StormMetrics {
    #[must_use]
    pub fn alloc_failure_ratio(&self) -> f64 {
        if self.alloc_attempts == 0 {
            0.0
        } else {
            self.alloc_failures as f64 / self.alloc_attempts as f64
        }
    }
}

struct StormRunner {
    heap: Heap,
    rng: XorShift64,
    kind: StormKind,
    target_ops: usize,
    ops: usize,
    alloc_attempts: usize,
    alloc_failures: usize,
    releases: usize,
    peak_top_index: usize,
    peak_free_chunks: usize,
    fragmentation_sum: u64,
}

impl StormRunner {
    fn new(kind: StormKind, strategy: Strategy, config: &StormConfig) -> Result<Self, StormError> {
        let heap = Heap::with_config(&HeapConfig {
            capacity: config.capacity,
            strategy,
            record_lifecycle: false,
        })?;
        Ok(Self {
            heap,
            rng: XorShift64::new(config.seed),
            kind,
            target_ops: config.steps,
            ops: 0,
            alloc_attempts: 0,
            alloc_failures: 0,
            releases: 0,
            peak_top_index: 0,
            peak_free_chunks: 0,
            fragmentation_sum: 0,
        })
    }

    fn done(&self) -> bool {
        self.ops >= self.target_ops
    }

    fn sample(&mut self) -> Result<(), StormError> {
        self.heap
            .check_invariants()
            .map_err(|violation| StormError::Invariant {
                storm: self.kind.as_str(),
                strategy: self.heap.strategy(),
                step: self.ops,
                violation,
            })?;
        let frag = Fragmentation::measure(&self.heap)?;
        self.fragmentation_sum += u64::from(frag.external_fragmentation_permille);
        self.peak_free_chunks = self.peak_free_chunks.max(frag.free_chunks);
        self.peak_top_index = self.peak_top_index.max(self.heap.top_index());
        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Result<bool, StormError> {
        let ok = self.heap.allocate(size as i64)?;
        self.ops += 1;
        self.alloc_attempts += 1;
        if !ok {
            self.alloc_failures += 1;
        }
        self.sample()?;
        Ok(ok)
    }

    /// Releases by the unit size of the `position`-th allocated chunk in address order.
    fn release_nth(&mut self, position: usize) -> Result<bool, StormError> {
        let live = self.live_units()?;
        let Some(&unit) = live.get(position) else {
            return Ok(false);
        };
        let ok = self.heap.release(unit as i64)?;
        self.ops += 1;
        if ok {
            self.releases += 1;
        }
        self.sample()?;
        Ok(ok)
    }

    fn release_random(&mut self) -> Result<bool, StormError> {
        let live = self.heap.allocated_chunk_count();
        if live == 0 {
            return Ok(false);
        }
        let position = self.rng.gen_range(0, live - 1);
        self.release_nth(position)
    }

    /// Unit sizes of the allocated chunks in address order.
    fn live_units(&self) -> Result<Vec<usize>, HeapError> {
        Ok(self
            .heap
            .chunks()?
            .into_iter()
            .filter(|chunk| !chunk.free)
            .map(|chunk| chunk.unit_size())
            .collect())
    }

    fn run(&mut self) -> Result<(), StormError> {
        match self.kind {
            StormKind::Sawtooth => self.run_sawtooth(),
            StormKind::RandomChurn => self.run_random_churn(),
            StormKind::SizeClassThrash => self.run_size_class_thrash(),
            StormKind::Exhaustion => self.run_exhaustion(),
        }
    }

    fn run_sawtooth(&mut self) -> Result<(), StormError> {
        while !self.done() {
            loop {
                let size = self.rng.gen_range(8, 128);
                if !self.allocate(size)? || self.done() {
                    break;
                }
            }
            while self.heap.allocated_chunk_count() > 0 && !self.done() {
                self.release_nth(0)?;
            }
        }
        Ok(())
    }

    fn run_random_churn(&mut self) -> Result<(), StormError> {
        while !self.done() {
            if self.rng.gen_range(0, 99) < 55 {
                let size = self.rng.gen_range(1, 256);
                self.allocate(size)?;
            } else if !self.release_random()? {
                let size = self.rng.gen_range(1, 64);
                self.allocate(size)?;
            }
        }
        Ok(())
    }

    fn run_size_class_thrash(&mut self) -> Result<(), StormError> {
        const SMALL: usize = 8;
        const LARGE: usize = 256;
        while !self.done() {
            let mut all_ok = true;
            for size in [SMALL, SMALL, LARGE] {
                if self.done() {
                    return Ok(());
                }
                all_ok &= self.allocate(size)?;
            }
            if !all_ok {
                // Out of room: drop every large chunk too, then start over.
                while self.heap.allocated_chunk_count() > 0 && !self.done() {
                    self.release_random()?;
                }
                continue;
            }
            if self.done() {
                break;
            }
            let live = self.live_units()?;
            if let Some(position) = live.iter().position(|unit| *unit == SMALL) {
                self.release_nth(position)?;
            }
        }
        Ok(())
    }

    fn run_exhaustion(&mut self) -> Result<(), StormError> {
        let mut size_ceiling = 32;
        while !self.done() {
            loop {
                let size = self.rng.gen_range(1, size_ceiling);
                if !self.allocate(size)? || self.done() {
                    break;
                }
            }
            // Punch holes at every other position, highest first.
            let live = self.heap.allocated_chunk_count();
            let mut position = live.saturating_sub(1) & !1;
            loop {
                if self.done() {
                    return Ok(());
                }
                self.release_nth(position)?;
                if position < 2 {
                    break;
                }
                position -= 2;
            }
            size_ceiling = if size_ceiling >= 256 { 32 } else { size_ceiling * 2 };
        }
        Ok(())
    }

    fn finish(self, seed: u64) -> Result<StormMetrics, StormError> {
        let samples = self.ops.max(1) as f64;
        Ok(StormMetrics {
            storm: self.kind.as_str().to_string(),
            strategy: self.heap.strategy().protocol_name().to_string(),
            seed,
            ops: self.ops,
            alloc_attempts: self.alloc_attempts,
            alloc_failures: self.alloc_failures,
            releases: self.releases,
            peak_top_index: self.peak_top_index,
            final_top_index: self.heap.top_index(),
            peak_free_chunks: self.peak_free_chunks,
            mean_external_fragmentation_permille: self.fragmentation_sum as f64 / samples,
            final_fragmentation: Fragmentation::measure(&self.heap)?,
        })
    }
}

/// Runs one storm against one strategy.
pub fn run_storm(
    kind: StormKind,
    strategy: Strategy,
    config: &StormConfig,
) -> Result<StormMetrics, StormError> {
    let mut runner = StormRunner::new(kind, strategy, config)?;
    runner.run()?;
    runner.finish(config.seed)
}

/// Runs every storm against every strategy on the same seed.
pub fn run_all(config: &StormConfig) -> Result<Vec<StormMetrics>, StormError> {
    let mut out = Vec::with_capacity(StormKind::all().len() * Strategy::ALL.len());
    for kind in StormKind::all() {
        for strategy in Strategy::ALL {
            out.push(run_storm(kind, strategy, config)?);
        }
    }
    Ok(out)
}
