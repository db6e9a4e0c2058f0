//! Batch and repeat status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job or step execution.
///
/// Variants are declared in severity order, which [`BatchStatus::upgrade_to`]
/// relies on when merging statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Finished successfully.
    Completed,
    /// Created but not yet running.
    Starting,
    /// Currently running.
    Started,
    /// A stop has been requested.
    Stopping,
    /// Stopped cooperatively; restartable.
    Stopped,
    /// Finished with an error; restartable.
    Failed,
    /// Marked as never to be restarted.
    Abandoned,
    /// State could not be determined.
    Unknown,
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "COMPLETED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Started => write!(f, "STARTED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Abandoned => write!(f, "ABANDONED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl BatchStatus {
    /// Returns true while the execution is starting or running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    /// Returns true for failed or stopped executions.
    #[must_use]
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped | Self::Abandoned | Self::Unknown)
    }

    /// Merges two statuses.
    ///
    /// Once either side is past `Started` the more severe status wins.
    /// Otherwise `Completed` beats `Starting` and `Started`.
    #[must_use]
    pub fn upgrade_to(self, other: Self) -> Self {
        if self > Self::Started || other > Self::Started {
            return self.max(other);
        }
        if self == Self::Completed || other == Self::Completed {
            return Self::Completed;
        }
        self.max(other)
    }
}

/// The result of one iteration of a repeat callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatStatus {
    /// More work may be available.
    Continuable,
    /// No more work.
    Finished,
}

impl RepeatStatus {
    /// Maps a boolean to a status.
    #[must_use]
    pub fn continue_if(continuable: bool) -> Self {
        if continuable {
            Self::Continuable
        } else {
            Self::Finished
        }
    }

    /// Returns true for [`RepeatStatus::Continuable`].
    #[must_use]
    pub fn is_continuable(&self) -> bool {
        matches!(self, Self::Continuable)
    }

    /// Logical AND of the continuable flags.
    #[must_use]
    pub fn and(self, continuable: bool) -> Self {
        Self::continue_if(self.is_continuable() && continuable)
    }
}

impl fmt::Display for RepeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuable => write!(f, "continuable"),
            Self::Finished => write!(f, "finished"),
        }
    }
}
