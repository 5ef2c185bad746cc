//! Heap configuration.
//!
//! Defaults can be overridden from the environment:
//! - `HEAPSIM_CAPACITY`: arena size in bytes, decimal or `0x` hex (default 512).
//! - `HEAPSIM_STRATEGY`: `firstFit`, `nextFit`, `bestFit`, or `worstFit`
//!   (case-insensitive, `-`/`_` ignored; default first-fit).

use thiserror::Error;

use crate::malloc::placement::Strategy;

/// Arena size used when nothing else is configured.
pub const DEFAULT_CAPACITY: usize = 512;

pub const CAPACITY_ENV: &str = "HEAPSIM_CAPACITY";
pub const STRATEGY_ENV: &str = "HEAPSIM_STRATEGY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("capacity must not be negative: {0}")]
    NegativeCapacity(String),
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),
    #[error("unknown placement strategy: {0}")]
    UnknownStrategy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Arena size in bytes.
    pub capacity: usize,
    pub strategy: Strategy,
    /// Keep lifecycle records on the heap (see `Heap::lifecycle_logs`).
    pub record_lifecycle: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            strategy: Strategy::default(),
            record_lifecycle: true,
        }
    }
}

impl HeapConfig {
    /// Defaults overridden by `HEAPSIM_CAPACITY` / `HEAPSIM_STRATEGY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HeapConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(CAPACITY_ENV) {
            config.capacity = parse_capacity(&raw)?;
        }
        if let Some(raw) = lookup(STRATEGY_ENV) {
            config.strategy = parse_strategy(&raw)?;
        }
        Ok(config)
    }
}

/// Parses an arena size: decimal or `0x`-prefixed hex, surrounding whitespace ignored.
pub fn parse_capacity(raw: &str) -> Result<usize, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('-') {
        return Err(ConfigError::NegativeCapacity(trimmed.to_string()));
    }
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => trimmed.parse::<usize>(),
    };
    parsed.map_err(|_| ConfigError::InvalidCapacity(trimmed.to_string()))
}

pub fn parse_strategy(raw: &str) -> Result<Strategy, ConfigError> {
    Strategy::from_str_loose(raw.trim())
        .ok_or_else(|| ConfigError::UnknownStrategy(raw.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = HeapConfig::default();
        assert_eq!(config.capacity, 512);
        assert_eq!(config.strategy, Strategy::FirstFit);
        assert!(config.record_lifecycle);
    }

    #[test]
    fn capacity_parsing() {
        assert_eq!(parse_capacity("4096"), Ok(4096));
        assert_eq!(parse_capacity(" 0x200 "), Ok(512));
        assert_eq!(parse_capacity("0X10"), Ok(16));
        assert!(matches!(
            parse_capacity("-1"),
            Err(ConfigError::NegativeCapacity(_))
        ));
        assert!(matches!(
            parse_capacity("lots"),
            Err(ConfigError::InvalidCapacity(_))
        ));
        assert!(matches!(
            parse_capacity(""),
            Err(ConfigError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(CAPACITY_ENV, "1024"), (STRATEGY_ENV, "worst_fit")]);
        let config = HeapConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.strategy, Strategy::WorstFit);
    }

    #[test]
    fn lookup_without_vars_is_default() {
        let config = HeapConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, HeapConfig::default());
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = HeapConfig::from_lookup(|key| {
            (key == STRATEGY_ENV).then(|| "buddy".to_string())
        })
        .unwrap_err();
        assert_eq!(err, ConfigError::UnknownStrategy("buddy".to_string()));
    }
}
