//! Machine-readable heap snapshot.

use heapsim_core::Heap;
use heapsim_core::HeapError;
use serde::{Deserialize, Serialize};

/// One non-empty size class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinReport {
    pub label: String,
    pub unit_size: usize,
    pub free_chunks: usize,
}

/// Free-space shape of the chunk chain. Space above the top index is not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragmentation {
    pub free_chunks: usize,
    /// Payload bytes held by free chunks.
    pub free_bytes: usize,
    pub largest_free_chunk: usize,
    /// `1000 * (1 - largest / free)`; 0 when nothing is free.
    pub external_fragmentation_permille: u32,
    /// Bytes between the top index and the end of the arena.
    pub untouched_bytes: usize,
}

impl Fragmentation {
    pub fn measure(heap: &Heap) -> Result<Self, HeapError> {
        let mut out = Self {
            untouched_bytes: heap.capacity() - heap.top_index(),
            ..Self::default()
        };
        for chunk in heap.chunks()?.into_iter().filter(|c| c.free) {
            out.free_chunks += 1;
            out.free_bytes += chunk.real_size();
            out.largest_free_chunk = out.largest_free_chunk.max(chunk.real_size());
        }
        if out.free_bytes > 0 {
            let scattered = (out.free_bytes - out.largest_free_chunk) as u64 * 1000;
            out.external_fragmentation_permille = (scattered / out.free_bytes as u64) as u32;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapReport {
    pub strategy: String,
    pub capacity: usize,
    pub top_index: usize,
    pub allocated_offsets: Vec<usize>,
    pub bins: Vec<BinReport>,
    pub fragmentation: Fragmentation,
}

impl HeapReport {
    pub fn capture(heap: &Heap) -> Result<Self, HeapError> {
        let bins = heap
            .bin_occupancy()?
            .into_iter()
            .map(|bin| BinReport {
                label: bin.label(),
                unit_size: bin.unit_size,
                free_chunks: bin.free_chunks,
            })
            .collect();
        Ok(Self {
            strategy: heap.strategy().protocol_name().to_string(),
            capacity: heap.capacity(),
            top_index: heap.top_index(),
            allocated_offsets: heap.allocated_chunk_offsets()?,
            bins,
            fragmentation: Fragmentation::measure(heap)?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapsim_core::Strategy;

    #[test]
    fn empty_heap_report() {
        let heap = Heap::new(512, Strategy::FirstFit).unwrap();
        let report = HeapReport::capture(&heap).unwrap();
        assert_eq!(report.strategy, "firstFit");
        assert_eq!(report.top_index, 0);
        assert!(report.allocated_offsets.is_empty());
        assert!(report.bins.is_empty());
        assert_eq!(report.fragmentation.untouched_bytes, 512);
        assert_eq!(report.fragmentation.external_fragmentation_permille, 0);
    }

    #[test]
    fn fragmentation_counts_scattered_free_space() {
        let mut heap = Heap::new(512, Strategy::FirstFit).unwrap();
        for size in [8, 8, 24, 8] {
            heap.allocate(size).unwrap();
        }
        heap.release(8).unwrap(); // offset 0
        heap.release(24).unwrap(); // offset 34

        let frag = Fragmentation::measure(&heap).unwrap();
        assert_eq!(frag.free_chunks, 2);
        assert_eq!(frag.free_bytes, 32);
        assert_eq!(frag.largest_free_chunk, 24);
        assert_eq!(frag.external_fragmentation_permille, 250);
    }

    #[test]
    fn report_serializes_bins_and_offsets() {
        let mut heap = Heap::new(256, Strategy::WorstFit).unwrap();
        heap.allocate(16).unwrap();
        heap.allocate(8).unwrap();
        heap.release(16).unwrap();

        let json = HeapReport::capture(&heap).unwrap().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["strategy"], "worstFit");
        assert_eq!(parsed["top_index"], 42);
        assert_eq!(parsed["allocated_offsets"], serde_json::json!([25]));
        assert_eq!(parsed["bins"][0]["label"], "bin2");
        assert_eq!(parsed["bins"][0]["free_chunks"], 1);
        assert_eq!(parsed["fragmentation"]["free_bytes"], 16);
    }
}
