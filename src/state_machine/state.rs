use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical lifecycle status shared by every platform.
///
/// `Completed`, `Failed` and `Cancelled` are terminal. `Unknown` is reached
/// only when a backend reports a status that has no mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    PreparingData,
    Submitted,
    Initializing,
    Queued,
    Running,
    Cancelling,
    UpdatingMetrics,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 12] = [
        JobStatus::Pending,
        JobStatus::PreparingData,
        JobStatus::Submitted,
        JobStatus::Initializing,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Cancelling,
        JobStatus::UpdatingMetrics,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Unknown,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses only the submission coordinator may hold a job in.
    pub fn is_pre_submission(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::PreparingData)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::PreparingData => "PREPARING_DATA",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::UpdatingMetrics => "UPDATING_METRICS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle table.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match self {
            Pending => matches!(next, PreparingData | Failed),
            PreparingData => matches!(next, Submitted | Queued | Failed),
            Submitted | Initializing | Queued => matches!(
                next,
                Submitted
                    | Initializing
                    | Queued
                    | Running
                    | Cancelling
                    | Completed
                    | Failed
                    | Unknown
            ) && next != self,
            Running => matches!(
                next,
                Completed | Failed | Cancelling | UpdatingMetrics | Queued | Unknown
            ),
            UpdatingMetrics => {
                matches!(next, Running | Completed | Failed | Cancelling | Queued)
            }
            Cancelling => matches!(next, Cancelled | Failed),
            Unknown => !next.is_pre_submission() && next != Unknown,
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// The result of reconciling a stored status with one reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Write the new status.
    Next(JobStatus),
    /// Reported status equals the stored one.
    Unchanged,
    /// The stored status is terminal and never changes again.
    Terminal,
    /// The move is outside the lifecycle table and is ignored.
    Rejected { from: JobStatus, to: JobStatus },
}

/// Decides how a backend-reported status advances a stored one.
pub struct StateMachine;

impl StateMachine {
    /// Compute the transition from `stored` given what the backend `reported`.
    ///
    /// - A terminal `stored` status never moves.
    /// - Edges of the lifecycle table are taken as-is.
    /// - A terminal `reported` status is accepted from any non-terminal state,
    ///   since the backend owns the job's completion.
    /// - Anything else is rejected and left for a later cycle.
    pub fn next(stored: JobStatus, reported: JobStatus) -> Transition {
        if stored.is_terminal() {
            return Transition::Terminal;
        }
        if stored == reported {
            return Transition::Unchanged;
        }
        if stored.can_transition_to(reported) {
            return Transition::Next(reported);
        }
        if reported.is_terminal() && !stored.is_pre_submission() {
            return Transition::Next(reported);
        }
        Transition::Rejected {
            from: stored,
            to: reported,
        }
    }
}
