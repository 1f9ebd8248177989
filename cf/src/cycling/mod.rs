//! Cycle-point algebra and the recurrence engine
//!
//! Cycle points are either non-negative integers or ISO-8601 instants with a
//! resolved UTC offset; the two never mix within one workflow. Durations and
//! recurrences follow ISO-8601 semantics, including add-with-clamp for
//! calendar months and years.

mod duration;
mod point;
mod recurrence;

pub use duration::{parse_delays, CycleDuration};
pub use point::CyclePoint;
pub use recurrence::{next_common_after, Recurrence, RecurrenceContext};

use serde::{Deserialize, Serialize};

/// Cycling mode of a workflow; fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclingMode {
    /// Points are non-negative integers
    Integer,
    /// Points are Gregorian-calendar date-times
    #[default]
    Gregorian,
}

impl std::fmt::Display for CyclingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Gregorian => write!(f, "gregorian"),
        }
    }
}

/// Errors from the cycling algebra
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// Unparseable cycle point
    #[error("invalid cycle point: {0}")]
    ParsePoint(String),
    /// Unparseable duration
    #[error("invalid duration: {0}")]
    ParseDuration(String),
    /// Unparseable recurrence expression
    #[error("invalid recurrence: {0}")]
    ParseRecurrence(String),
    /// Integer and date-time values mixed in one operation
    #[error("cycling mode mismatch: {0}")]
    ModeMismatch(String),
}
