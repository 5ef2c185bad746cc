//! Tooling around the heapsim engine.
//!
//! This crate provides:
//! - Command interpreter: the `setBinManager` / `malloc` / `free` text protocol
//! - Structured logging: JSONL records for engine and interpreter events
//! - Reports: JSON heap snapshots with fragmentation figures
//! - Storms: deterministic workloads comparing placement strategies

#![forbid(unsafe_code)]

pub mod interpreter;
pub mod report;
pub mod storm;
pub mod structured_log;

pub use interpreter::{Command, CommandError, Interpreter, InterpreterError};
pub use report::{Fragmentation, HeapReport};
pub use storm::{StormConfig, StormError, StormKind, StormMetrics};
