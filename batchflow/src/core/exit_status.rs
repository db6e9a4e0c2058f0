//! Composable exit status value object.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code of a running or unknown execution.
pub const UNKNOWN: &str = "UNKNOWN";
/// Exit code while processing continues.
pub const EXECUTING: &str = "EXECUTING";
/// Exit code of a successful run.
pub const COMPLETED: &str = "COMPLETED";
/// Exit code when nothing was done.
pub const NOOP: &str = "NOOP";
/// Exit code of a failed run.
pub const FAILED: &str = "FAILED";
/// Exit code of a stopped run.
pub const STOPPED: &str = "STOPPED";

/// Outcome descriptor of a step or job: continuable flag, code and description.
///
/// Statuses compose with [`ExitStatus::and`], which is how partition and step
/// results are folded into one parent status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    continuable: bool,
    exit_code: String,
    exit_description: String,
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl ExitStatus {
    /// Creates a status with an empty description.
    #[must_use]
    pub fn new(continuable: bool, exit_code: impl Into<String>) -> Self {
        Self::with_description(continuable, exit_code, "")
    }

    /// Creates a status with a description.
    #[must_use]
    pub fn with_description(
        continuable: bool,
        exit_code: impl Into<String>,
        exit_description: impl Into<String>,
    ) -> Self {
        Self {
            continuable,
            exit_code: exit_code.into(),
            exit_description: exit_description.into(),
        }
    }

    /// Continuable status for an execution in an unknown state.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(true, UNKNOWN)
    }

    /// Continuable status for a running execution.
    #[must_use]
    pub fn executing() -> Self {
        Self::new(true, EXECUTING)
    }

    /// Finished status for a successful execution.
    #[must_use]
    pub fn completed() -> Self {
        Self::new(false, COMPLETED)
    }

    /// Finished status for an execution that did no work.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(false, NOOP)
    }

    /// Finished status for a failed execution.
    #[must_use]
    pub fn failed() -> Self {
        Self::new(false, FAILED)
    }

    /// Finished status for a stopped execution.
    #[must_use]
    pub fn stopped() -> Self {
        Self::new(false, STOPPED)
    }

    /// Returns whether processing may continue.
    #[must_use]
    pub fn is_continuable(&self) -> bool {
        self.continuable
    }

    /// Returns the exit code.
    #[must_use]
    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    /// Returns the exit description.
    #[must_use]
    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    /// Returns true for the `EXECUTING` and `UNKNOWN` codes.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit_code == EXECUTING || self.exit_code == UNKNOWN
    }

    fn severity(&self) -> u8 {
        match self.exit_code.as_str() {
            FAILED => 3,
            STOPPED => 2,
            _ => 1,
        }
    }

    /// ANDs the continuable flag, keeping code and description.
    #[must_use]
    pub fn and_continuable(&self, continuable: bool) -> Self {
        Self {
            continuable: self.continuable && continuable,
            ..self.clone()
        }
    }

    /// Combines two statuses.
    ///
    /// The continuable flag is the logical AND of both. A finished status
    /// keeps its code against a continuable one; between two finished
    /// statuses the more severe code wins (`FAILED` over `STOPPED` over the
    /// rest), with ties going to `other`. Descriptions are concatenated.
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let code = match (self.continuable, other.continuable) {
            (true, _) => other.exit_code.clone(),
            (false, true) => self.exit_code.clone(),
            (false, false) => {
                if other.severity() >= self.severity() {
                    other.exit_code.clone()
                } else {
                    self.exit_code.clone()
                }
            }
        };

        let mut result = self.and_continuable(other.continuable);
        result.exit_code = code;
        result.add_exit_description(&other.exit_description)
    }

    /// Returns a copy with a different exit code.
    #[must_use]
    pub fn replace_exit_code(&self, exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with the description appended.
    ///
    /// Empty descriptions and exact repeats are ignored.
    #[must_use]
    pub fn add_exit_description(&self, description: &str) -> Self {
        let description = description.trim();
        if description.is_empty() || self.exit_description == description {
            return self.clone();
        }

        let exit_description = if self.exit_description.is_empty() {
            description.to_string()
        } else {
            format!("{}; {}", self.exit_description, description)
        };

        Self {
            exit_description,
            ..self.clone()
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "continuable={};exitCode={};exitDescription={}",
            self.continuable, self.exit_code, self.exit_description
        )
    }
}
