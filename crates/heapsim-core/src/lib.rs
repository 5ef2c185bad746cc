//! # heapsim-core
//!
//! A heap allocator simulated over a fixed byte arena.
//!
//! Chunks carry boundary-tag headers, free chunks are kept in address-ordered
//! circular lists, and one of four placement strategies (first, best, worst,
//! or next fit) chooses which free chunk serves a request. No `unsafe` code is
//! permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod malloc;

pub use config::{ConfigError, HeapConfig};
pub use malloc::{Heap, HeapError, SharedHeap, Strategy};
