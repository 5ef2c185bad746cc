//! Simulated heap allocation.
//!
//! Chunks with boundary-tag headers live in a fixed arena:
//! - `chunk`: header codec over the arena bytes
//! - `bins`: address-ordered circular free lists, segregated or unified
//! - `placement`: first/best/worst/next-fit candidate selection
//! - `allocator`: the heap engine (split, bump, coalesce, top retreat)

pub mod allocator;
pub mod bins;
pub mod chunk;
pub mod placement;
pub mod shared;

pub use allocator::{ChunkInfo, Heap, HeapError, HeapLogLevel, HeapLogRecord, InvariantViolation};
pub use bins::{BinCollection, BinError, BinLayout, BinOccupancy, MAX_BIN_UNIT_SIZE, SMALL_BIN_COUNT};
pub use chunk::{Arena, ChunkError, HEADER_SIZE, UNIT};
pub use placement::{NextFitCursor, Placement, Strategy};
pub use shared::SharedHeap;
