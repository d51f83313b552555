//! # Generation Stoppers Module
//!
//! Decides when a completion run should end, apart from end-of-sequence
//! detection which the controller handles directly.
//!
//! - [`StopSequenceMatcher`] scans unsent text for configured stop strings and
//!   reports full or partial matches.
//! - [`TokenBudget`] tracks the remaining generation budget (`n_predict`),
//!   including the one-token extension granted when a multi-byte character is
//!   split across tokens.
//!
//! Both are plain values owned by a single run; neither holds a model handle.

pub mod budget;
pub mod stop_sequence;

pub use budget::TokenBudget;
pub use stop_sequence::{find_full_stop, find_partial_stop, StopSequenceMatcher};

/// Result of checking unsent text against the stop strings.
///
/// Offsets are byte offsets into the checked text and always fall on a
/// character boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMatch {
    /// A stop string occurs in full at `offset`. Text from `offset` on is
    /// dropped.
    Full { offset: usize, stop_index: usize },
    /// The text ends with a prefix of a stop string starting at `offset`.
    /// Text from `offset` on is withheld.
    Partial { offset: usize },
}

impl StopMatch {
    pub fn offset(&self) -> usize {
        match self {
            StopMatch::Full { offset, .. } | StopMatch::Partial { offset } => *offset,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, StopMatch::Full { .. })
    }
}
