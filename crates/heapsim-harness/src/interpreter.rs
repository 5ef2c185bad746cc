//! Line-oriented command interpreter.
//!
//! One command per line, space separated:
//! `setBinManager <firstFit|nextFit|bestFit|worstFit>`, `malloc <n>`, `free <n>`.
//! Every command prints its outcome; malformed input prints a message and
//! leaves the heap untouched. Selecting a new bin manager, and reaching the
//! end of input, print a summary of the heap being retired.

use std::io::{BufRead, Write};

use heapsim_core::malloc::Heap;
use heapsim_core::{HeapConfig, HeapError, Strategy};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

/// Malformed input. The message is what the user sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid command!")]
    InvalidCommand,
    #[error("No valid number for allocation")]
    InvalidAllocationSize,
    #[error("No valid number for deallocation")]
    InvalidDeallocationSize,
    #[error("No valid bin manager! No heap has been created.")]
    UnknownBinManager,
    #[error("No heap has been setup")]
    NoHeap,
}

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("heap contract violation: {0}")]
    Heap(#[from] HeapError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Raw strategy name; resolved when the command runs.
    SetBinManager(String),
    Malloc(i64),
    Free(i64),
}

impl Command {
    /// Parses one input line. Blank lines yield `Ok(None)`.
    ///
    /// Only the first argument is read; anything after it is ignored.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut args: Vec<&str> = line.split(' ').collect();
        while args.last().is_some_and(|arg| arg.is_empty()) {
            args.pop();
        }

        match args.as_slice() {
            [] => Ok(None),
            [_] => Err(CommandError::InvalidCommand),
            ["setBinManager", name, ..] => Ok(Some(Self::SetBinManager((*name).to_string()))),
            ["malloc", size, ..] => size
                .parse()
                .map(|size| Some(Self::Malloc(size)))
                .map_err(|_| CommandError::InvalidAllocationSize),
            ["free", size, ..] => size
                .parse()
                .map(|size| Some(Self::Free(size)))
                .map_err(|_| CommandError::InvalidDeallocationSize),
            _ => Err(CommandError::InvalidCommand),
        }
    }
}

/// Resolves a protocol strategy name (`firstFit`, ...). Exact match only.
#[must_use]
pub fn strategy_by_protocol_name(name: &str) -> Option<Strategy> {
    Strategy::ALL
        .into_iter()
        .find(|strategy| strategy.protocol_name() == name)
}

/// Runs commands against at most one live heap, writing the transcript to `out`.
pub struct Interpreter<W: Write> {
    out: W,
    config: HeapConfig,
    heap: Option<Heap>,
    log: Option<LogEmitter>,
    line_number: usize,
}

impl<W: Write> Interpreter<W> {
    /// Heaps are created with `config.capacity`; the strategy comes from each
    /// `setBinManager` command.
    pub fn new(out: W, config: HeapConfig) -> Self {
        Self {
            out,
            config,
            heap: None,
            log: None,
            line_number: 0,
        }
    }

    /// Mirrors heap lifecycle records and rejected commands into `emitter`.
    #[must_use]
    pub fn with_log(mut self, emitter: LogEmitter) -> Self {
        self.log = Some(emitter);
        self
    }

    /// Processes every line of `input`, then prints the final heap summary.
    pub fn run<R: BufRead>(&mut self, input: R) -> Result<(), InterpreterError> {
        for line in input.lines() {
            self.process_line(&line?)?;
        }
        self.finish()
    }

    pub fn process_line(&mut self, line: &str) -> Result<(), InterpreterError> {
        self.line_number += 1;
        match Command::parse(line) {
            Ok(Some(command)) => self.execute(command),
            Ok(None) => Ok(()),
            Err(err) => self.reject(err, line),
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<(), InterpreterError> {
        match command {
            Command::SetBinManager(name) => {
                if self.heap.is_some() {
                    self.print_end_info()?;
                }
                let Some(strategy) = strategy_by_protocol_name(&name) else {
                    return self.reject(CommandError::UnknownBinManager, &name);
                };
                self.create_heap(strategy)
            }
            Command::Malloc(size) => {
                let Some(heap) = self.heap.as_mut() else {
                    return self.reject(CommandError::NoHeap, "malloc");
                };
                let ok = heap.allocate(size)?;
                self.print_action(ok, size, "allocation")?;
                self.print_allocated_chunks()?;
                self.flush_heap_logs()
            }
            Command::Free(size) => {
                let Some(heap) = self.heap.as_mut() else {
                    return self.reject(CommandError::NoHeap, "free");
                };
                let ok = heap.release(size)?;
                self.print_action(ok, size, "deallocation")?;
                self.print_bins()?;
                self.flush_heap_logs()
            }
        }
    }

    /// Prints the summary of the live heap, if any, and flushes output.
    pub fn finish(&mut self) -> Result<(), InterpreterError> {
        if self.heap.is_some() {
            self.print_end_info()?;
        }
        self.out.flush()?;
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn heap(&self) -> Option<&Heap> {
        self.heap.as_ref()
    }

    pub fn log(&self) -> Option<&LogEmitter> {
        self.log.as_ref()
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn create_heap(&mut self, strategy: Strategy) -> Result<(), InterpreterError> {
        let config = HeapConfig {
            strategy,
            ..self.config.clone()
        };
        let heap = Heap::with_config(&config)?;
        writeln!(
            self.out,
            "Heap with {} as bin manager has been created",
            strategy.protocol_name()
        )?;
        if let Some(log) = self.log.as_mut() {
            let entry = LogEntry::new("", LogLevel::Info, "heap_created")
                .with_symbol("setBinManager")
                .with_strategy(strategy)
                .with_outcome("created")
                .with_details(serde_json::json!({ "capacity": heap.capacity() }));
            log.emit_entry(entry)?;
        }
        self.heap = Some(heap);
        Ok(())
    }

    fn reject(&mut self, err: CommandError, input: &str) -> Result<(), InterpreterError> {
        writeln!(self.out, "{err}")?;
        if let Some(log) = self.log.as_mut() {
            let entry = LogEntry::new("", LogLevel::Warn, "command_rejected")
                .with_outcome("rejected")
                .with_details(serde_json::json!({
                    "line": self.line_number,
                    "input": input,
                    "message": err.to_string(),
                }));
            log.emit_entry(entry)?;
        }
        Ok(())
    }

    fn print_action(&mut self, ok: bool, size: i64, action: &str) -> Result<(), InterpreterError> {
        if ok {
            writeln!(self.out, "Memory {size} bytes {action} was successful.")?;
        } else {
            writeln!(self.out, "Memory {size} bytes {action} failed.")?;
        }
        Ok(())
    }

    fn print_allocated_chunks(&mut self) -> Result<(), InterpreterError> {
        let Some(heap) = self.heap.as_ref() else {
            return Ok(());
        };
        let offsets = heap.allocated_chunk_offsets()?;
        if offsets.is_empty() {
            writeln!(self.out, "No allocated chunk exist")?;
        } else {
            for offset in offsets {
                write!(self.out, "{offset} ")?;
            }
            writeln!(self.out, "{}", heap.top_index())?;
        }
        Ok(())
    }

    fn print_bins(&mut self) -> Result<(), InterpreterError> {
        let Some(heap) = self.heap.as_ref() else {
            return Ok(());
        };
        let bins = heap.bin_occupancy()?;
        if bins.is_empty() {
            writeln!(self.out, "No bin exist")?;
        }
        for bin in bins {
            writeln!(self.out, "{} {}", bin.label(), bin.free_chunks)?;
        }
        Ok(())
    }

    fn print_end_info(&mut self) -> Result<(), InterpreterError> {
        writeln!(self.out)?;
        writeln!(self.out, "Print heap info at end:")?;
        self.print_bins()?;
        self.print_allocated_chunks()?;
        writeln!(self.out)?;
        self.flush_heap_logs()
    }

    /// Drains the heap's lifecycle records after every command, mirroring them
    /// into the emitter when one is attached.
    fn flush_heap_logs(&mut self) -> Result<(), InterpreterError> {
        let Some(heap) = self.heap.as_mut() else {
            return Ok(());
        };
        let records = heap.drain_lifecycle_logs();
        if let Some(log) = self.log.as_mut() {
            log.emit_heap_records(&records, heap.strategy())?;
        }
        Ok(())
    }
}
