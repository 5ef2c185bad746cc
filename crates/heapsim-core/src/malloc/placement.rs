//! Placement strategies.
//!
//! A strategy picks a free chunk able to hold a request, or reports none so
//! the heap falls back to bump allocation. The segregated strategies only look
//! at bin heads; next-fit walks physical memory and a single unified list.

use std::fmt;

use super::bins::{BinCollection, BinError, BinLayout};
use super::chunk::Arena;

/// Placement policy selected for a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Smallest non-empty class at or above the request.
    #[default]
    FirstFit,
    /// Resumes from the chunk it handed out last.
    NextFit,
    /// First non-empty qualifying class scanning up from the smallest class.
    BestFit,
    /// Largest non-empty class, if it can hold the request.
    WorstFit,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::FirstFit,
        Strategy::NextFit,
        Strategy::BestFit,
        Strategy::WorstFit,
    ];

    /// Parse from a protocol or config name (case-insensitive, `-`/`_` ignored).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "firstfit" | "first" => Some(Self::FirstFit),
            "nextfit" | "next" => Some(Self::NextFit),
            "bestfit" | "best" => Some(Self::BestFit),
            "worstfit" | "worst" => Some(Self::WorstFit),
            _ => None,
        }
    }

    /// Name used by the command protocol (`setBinManager <name>`).
    #[must_use]
    pub const fn protocol_name(self) -> &'static str {
        match self {
            Self::FirstFit => "firstFit",
            Self::NextFit => "nextFit",
            Self::BestFit => "bestFit",
            Self::WorstFit => "worstFit",
        }
    }

    /// Bin layout the strategy searches.
    #[must_use]
    pub const fn bin_layout(self) -> BinLayout {
        match self {
            Self::NextFit => BinLayout::Unified,
            Self::FirstFit | Self::BestFit | Self::WorstFit => BinLayout::Segregated,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_name())
    }
}

/// Strategy plus whatever search state it carries between calls.
#[derive(Debug, Clone)]
pub enum Placement {
    FirstFit,
    BestFit,
    WorstFit,
    NextFit(NextFitCursor),
}

impl Placement {
    #[must_use]
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::FirstFit => Self::FirstFit,
            Strategy::BestFit => Self::BestFit,
            Strategy::WorstFit => Self::WorstFit,
            Strategy::NextFit => Self::NextFit(NextFitCursor::default()),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        match self {
            Self::FirstFit => Strategy::FirstFit,
            Self::BestFit => Strategy::BestFit,
            Self::WorstFit => Strategy::WorstFit,
            Self::NextFit(_) => Strategy::NextFit,
        }
    }

    /// Picks a free chunk of at least `unit_size` payload, or `None`.
    pub fn find_candidate(
        &mut self,
        unit_size: usize,
        bins: &BinCollection,
        arena: &Arena,
        top_index: usize,
    ) -> Result<Option<usize>, BinError> {
        match self {
            Self::FirstFit => first_fit(unit_size, bins, arena),
            Self::BestFit => best_fit(unit_size, bins, arena),
            Self::WorstFit => worst_fit(unit_size, bins, arena),
            Self::NextFit(cursor) => cursor.find(unit_size, bins, arena, top_index),
        }
    }
}

fn first_fit(
    unit_size: usize,
    bins: &BinCollection,
    arena: &Arena,
) -> Result<Option<usize>, BinError> {
    let Some(start) = bins.class_slot(unit_size) else {
        return Ok(None);
    };
    for head in bins.heads().skip(start).flatten() {
        if arena.unit_size(head)? >= unit_size {
            return Ok(Some(head));
        }
    }
    Ok(None)
}

// Same answer as first-fit: every class is a single exact size, so the first
// qualifying class scanning up is also the tightest.
fn best_fit(
    unit_size: usize,
    bins: &BinCollection,
    arena: &Arena,
) -> Result<Option<usize>, BinError> {
    for head in bins.heads().flatten() {
        if arena.unit_size(head)? >= unit_size {
            return Ok(Some(head));
        }
    }
    Ok(None)
}

fn worst_fit(
    unit_size: usize,
    bins: &BinCollection,
    arena: &Arena,
) -> Result<Option<usize>, BinError> {
    // Classes only shrink from here, so the first non-empty one decides.
    let Some(head) = bins.heads().rev().flatten().next() else {
        return Ok(None);
    };
    if arena.unit_size(head)? >= unit_size {
        Ok(Some(head))
    } else {
        Ok(None)
    }
}

/// Next-fit search state: the chunk handed out by the previous call.
#[derive(Debug, Clone, Default)]
pub struct NextFitCursor {
    last: Option<usize>,
}

impl NextFitCursor {
    /// Offset of the chunk handed out most recently.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        self.last
    }

    fn find(
        &mut self,
        unit_size: usize,
        bins: &BinCollection,
        arena: &Arena,
        top_index: usize,
    ) -> Result<Option<usize>, BinError> {
        if top_index == 0 || bins.head(unit_size)?.is_none() {
            return Ok(None);
        }

        let Some(start) = self.recover(arena, top_index)? else {
            return Ok(None);
        };

        let mut index = start;
        loop {
            if arena.unit_size(index)? >= unit_size {
                self.last = Some(index);
                return Ok(Some(index));
            }
            index = arena.forward_free_index(index)?;
            if index == start {
                self.last = Some(start);
                return Ok(None);
            }
        }
    }

    /// First free chunk starting from the one holding the cursor, wrapping once
    /// around the chain.
    fn recover(&self, arena: &Arena, top_index: usize) -> Result<Option<usize>, BinError> {
        let origin = match self.last {
            Some(last) if last < top_index => {
                // Realign to the chunk containing `last`; it may have been
                // absorbed by a free neighbour below it.
                let mut at = 0;
                loop {
                    let next = arena.next_chunk_index(at)?;
                    if next > last {
                        break at;
                    }
                    at = next;
                }
            }
            _ => 0,
        };

        let mut at = origin;
        loop {
            if arena.is_free(at)? {
                return Ok(Some(at));
            }
            at = arena.next_chunk_index(at)?;
            if at >= top_index {
                at = 0;
            }
            if at == origin {
                return Ok(None);
            }
        }
    }
}
