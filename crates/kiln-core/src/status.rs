//! Step outcomes and build result codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a build step or command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultStatus {
    #[default]
    NotProcessed,
    Successful,
    Failed,
    Cancelled,
    NotTriggeredWasSuccessful,
    NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
    pub const ALL: [ResultStatus; 6] = [
        ResultStatus::NotProcessed,
        ResultStatus::Successful,
        ResultStatus::Failed,
        ResultStatus::Cancelled,
        ResultStatus::NotTriggeredWasSuccessful,
        ResultStatus::NotTriggeredPrerequisiteFailed,
    ];

    /// Whether the step reached one of the five terminal outcomes
    pub fn is_processed(self) -> bool {
        self != ResultStatus::NotProcessed
    }

    /// Successful execution, even if the command was not triggered
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful
        )
    }

    /// Failed execution, even if the command was not triggered
    pub fn failed(self) -> bool {
        matches!(
            self,
            ResultStatus::Failed | ResultStatus::NotTriggeredPrerequisiteFailed
        )
    }

    pub(crate) fn ordinal(self) -> usize {
        match self {
            ResultStatus::NotProcessed => 0,
            ResultStatus::Successful => 1,
            ResultStatus::Failed => 2,
            ResultStatus::Cancelled => 3,
            ResultStatus::NotTriggeredWasSuccessful => 4,
            ResultStatus::NotTriggeredPrerequisiteFailed => 5,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultStatus::NotProcessed => "not processed",
            ResultStatus::Successful => "successful",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::NotTriggeredWasSuccessful => "up-to-date",
            ResultStatus::NotTriggeredPrerequisiteFailed => "prerequisite failed",
        };
        f.write_str(name)
    }
}

/// Aggregate result of a whole build run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildResultCode {
    Successful,
    BuildError,
}

impl BuildResultCode {
    pub fn exit_code(self) -> u8 {
        match self {
            BuildResultCode::Successful => 0,
            BuildResultCode::BuildError => 1,
        }
    }

    pub fn from_status(status: ResultStatus) -> Self {
        if status.succeeded() {
            BuildResultCode::Successful
        } else {
            BuildResultCode::BuildError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = ResultStatus::ALL
            .iter()
            .filter(|s| s.is_processed())
            .collect();
        assert_eq!(terminal.len(), 5);
        assert!(!ResultStatus::NotProcessed.succeeded());
        assert!(!ResultStatus::NotProcessed.failed());
        assert!(!ResultStatus::Cancelled.succeeded());
        assert!(!ResultStatus::Cancelled.failed());
    }

    #[test]
    fn test_ordinals_are_unique() {
        let mut seen = [false; 6];
        for status in ResultStatus::ALL {
            assert!(!seen[status.ordinal()]);
            seen[status.ordinal()] = true;
        }
    }
}
