//! Job status and the state machine that guards its transitions.
//!
//! The permitted transitions are encoded as data so the table can be checked
//! exhaustively. A cancellation can race an in-flight session setup; in that
//! case the work is already spent, so `executing` on a cancelled job is
//! absorbed and a later success still lands in `Completed`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LeetError;

/// Status of an individual job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event applied to a job's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobTrigger {
    Pending,
    Executing,
    Cancel,
    Completed,
    Error,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Pending => "pending",
            JobTrigger::Executing => "executing",
            JobTrigger::Cancel => "cancel",
            JobTrigger::Completed => "completed",
            JobTrigger::Error => "error",
        }
    }
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Permitted transitions: (source, trigger) -> destination.
const TRANSITIONS: &[(JobStatus, JobTrigger, JobStatus)] = &[
    (JobStatus::Pending, JobTrigger::Pending, JobStatus::Pending),
    (JobStatus::Pending, JobTrigger::Executing, JobStatus::Executing),
    (JobStatus::Pending, JobTrigger::Cancel, JobStatus::Cancelled),
    (JobStatus::Pending, JobTrigger::Error, JobStatus::Error),
    (JobStatus::Executing, JobTrigger::Pending, JobStatus::Pending),
    (JobStatus::Executing, JobTrigger::Cancel, JobStatus::Cancelled),
    (
        JobStatus::Executing,
        JobTrigger::Completed,
        JobStatus::Completed,
    ),
    (JobStatus::Executing, JobTrigger::Error, JobStatus::Error),
    (
        JobStatus::Cancelled,
        JobTrigger::Completed,
        JobStatus::Completed,
    ),
    // Absorbing: cancellation raced a session setup, let the work finish.
    (
        JobStatus::Cancelled,
        JobTrigger::Executing,
        JobStatus::Cancelled,
    ),
];

/// The per-job state machine. Callers serialise access through the job's
/// lock; this type itself is plain data.
#[derive(Debug, Clone)]
pub struct JobFsm {
    current: JobStatus,
}

impl JobFsm {
    pub fn new() -> Self {
        Self {
            current: JobStatus::Pending,
        }
    }

    pub fn current(&self) -> JobStatus {
        self.current
    }

    /// Apply a trigger. Unlisted pairs leave the state untouched and fail.
    pub fn fire(&mut self, trigger: JobTrigger) -> Result<JobStatus, LeetError> {
        match TRANSITIONS
            .iter()
            .find(|(source, t, _)| *source == self.current && *t == trigger)
        {
            Some((_, _, dest)) => {
                self.current = *dest;
                Ok(*dest)
            }
            None => Err(LeetError::InvalidTransition {
                from: self.current,
                trigger,
            }),
        }
    }
}

impl Default for JobFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Executing,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Error,
    ];

    const ALL_TRIGGERS: [JobTrigger; 5] = [
        JobTrigger::Pending,
        JobTrigger::Executing,
        JobTrigger::Cancel,
        JobTrigger::Completed,
        JobTrigger::Error,
    ];

    fn fsm_at(status: JobStatus) -> JobFsm {
        JobFsm { current: status }
    }

    /// Every (state, trigger) pair behaves exactly as the table says:
    /// listed pairs land on the listed destination, unlisted pairs fail and
    /// leave the state untouched.
    #[test]
    fn table_is_exhaustive() {
        for source in ALL_STATUSES {
            for trigger in ALL_TRIGGERS {
                let expected = TRANSITIONS
                    .iter()
                    .find(|(s, t, _)| *s == source && *t == trigger)
                    .map(|(_, _, d)| *d);

                let mut fsm = fsm_at(source);
                match fsm.fire(trigger) {
                    Ok(dest) => {
                        assert_eq!(Some(dest), expected, "{source} + {trigger}");
                        assert_eq!(fsm.current(), dest);
                    }
                    Err(LeetError::InvalidTransition { from, trigger: t }) => {
                        assert_eq!(expected, None, "{source} + {trigger}");
                        assert_eq!(from, source);
                        assert_eq!(t, trigger);
                        assert_eq!(fsm.current(), source);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [JobStatus::Completed, JobStatus::Error] {
            for trigger in ALL_TRIGGERS {
                assert!(fsm_at(terminal).fire(trigger).is_err());
            }
        }
    }

    #[test]
    fn cancelled_absorbs_executing() {
        let mut fsm = JobFsm::new();
        fsm.fire(JobTrigger::Cancel).unwrap();
        assert_eq!(fsm.fire(JobTrigger::Executing).unwrap(), JobStatus::Cancelled);
        assert_eq!(fsm.fire(JobTrigger::Completed).unwrap(), JobStatus::Completed);
    }

    #[test]
    fn session_retry_cycle() {
        let mut fsm = JobFsm::new();
        fsm.fire(JobTrigger::Executing).unwrap();
        assert_eq!(fsm.fire(JobTrigger::Pending).unwrap(), JobStatus::Pending);
        fsm.fire(JobTrigger::Executing).unwrap();
        assert_eq!(fsm.fire(JobTrigger::Completed).unwrap(), JobStatus::Completed);
    }
}
