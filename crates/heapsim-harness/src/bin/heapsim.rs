//! CLI entrypoint for the heap simulator.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use heapsim_core::HeapConfig;
use heapsim_core::config::{parse_capacity, parse_strategy};
use heapsim_harness::interpreter::Interpreter;
use heapsim_harness::report::HeapReport;
use heapsim_harness::storm::{self, StormConfig};
use heapsim_harness::structured_log::{LogEmitter, validate_log_file};

/// Heap allocator simulator.
#[derive(Debug, Parser)]
#[command(name = "heapsim")]
#[command(about = "Boundary-tag heap simulator with pluggable placement strategies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command script (`setBinManager`, `malloc`, `free`).
    Run {
        /// Script path; reads stdin when omitted.
        script: Option<PathBuf>,
        /// Arena size in bytes (decimal or 0x...). Overrides HEAPSIM_CAPACITY.
        #[arg(long)]
        capacity: Option<String>,
        /// Create a heap with this strategy before the first line.
        #[arg(long)]
        strategy: Option<String>,
        /// Write structured JSONL logs to this path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Write a JSON report of the last heap to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run every fragmentation storm against every strategy.
    Storm {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x5EED")]
        seed: String,
        /// Operations per storm.
        #[arg(long, default_value_t = 2_000)]
        steps: usize,
        /// Arena size in bytes (decimal or 0x...).
        #[arg(long, default_value = "4096")]
        capacity: String,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Log path.
        path: PathBuf,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid seed '{raw}': {err}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            script,
            capacity,
            strategy,
            log,
            report,
        } => {
            let mut config = HeapConfig::from_env()?;
            if let Some(raw) = capacity {
                config.capacity = parse_capacity(&raw)?;
            }
            let initial = strategy.as_deref().map(parse_strategy).transpose()?;

            let stdout = io::stdout().lock();
            let mut interpreter = Interpreter::new(stdout, config);
            if let Some(path) = &log {
                let run_id = format!("run-{}", std::process::id());
                interpreter = interpreter.with_log(LogEmitter::to_file(path, &run_id)?);
            }
            if let Some(strategy) = initial {
                interpreter.process_line(&format!("setBinManager {}", strategy.protocol_name()))?;
            }

            match &script {
                Some(path) => interpreter.run(BufReader::new(File::open(path)?))?,
                None => interpreter.run(io::stdin().lock())?,
            }

            if let Some(path) = report {
                let Some(heap) = interpreter.heap() else {
                    return Err("no heap was created; nothing to report".into());
                };
                std::fs::write(&path, HeapReport::capture(heap)?.to_json()?)?;
                eprintln!("Wrote heap report to {}", path.display());
            }
            if let Some(path) = log {
                eprintln!("Wrote structured log to {}", path.display());
            }
        }
        Command::Storm {
            seed,
            steps,
            capacity,
            output,
        } => {
            let config = StormConfig {
                seed: parse_seed(&seed)?,
                steps,
                capacity: parse_capacity(&capacity)?,
            };
            let metrics = storm::run_all(&config)?;
            for m in &metrics {
                eprintln!(
                    "{:<18} {:<9} failures={:>5.1}% mean_frag={:>6.1}\u{2030} peak_top={}",
                    m.storm,
                    m.strategy,
                    m.alloc_failure_ratio() * 100.0,
                    m.mean_external_fragmentation_permille,
                    m.peak_top_index,
                );
            }
            let json = serde_json::to_string_pretty(&metrics)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote storm metrics to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Command::ValidateLog { path } => {
            let (lines, errors) = validate_log_file(&path)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation errors across {lines} lines in {}",
                    errors.len(),
                    path.display()
                )
                .into());
            }
            println!("{}: {lines} valid log lines", path.display());
        }
    }

    Ok(())
}
