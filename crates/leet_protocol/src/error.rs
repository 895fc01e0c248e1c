//! Error taxonomy.
//!
//! Only two kinds cross the session boundary into a plugin: `SessionError`
//! (the remote channel is gone) and `CommandError` (one operation failed but
//! the session is alive). Backend-specific errors must be converted to one of
//! the two before they reach a plugin.

use thiserror::Error;

use crate::status::{JobStatus, JobTrigger};
use crate::types::{JobId, SearchId};

/// The remote channel was lost.
///
/// With `stop` unset the job is eligible for another attempt through the
/// online probe; with `stop` set the job is published as-is and no new
/// session is opened for it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SessionError {
    pub message: String,
    pub stop: bool,
}

impl SessionError {
    /// Channel lost, retry through a new probe cycle.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stop: false,
        }
    }

    /// Channel lost, give the job up.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stop: true,
        }
    }
}

/// A single session operation failed; the session itself is still usable.
/// The plugin decides whether this surfaces.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A plugin-originated failure. The job moves to `Error` and the message is
/// captured as the single result row.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CommandError> for PluginError {
    fn from(err: CommandError) -> Self {
        PluginError(err.0)
    }
}

/// Either of the two kinds a session operation may surface.
#[derive(Debug, Clone, Error)]
pub enum SessionFailure {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// What a plugin run can abort with.
///
/// Session losses pass through untouched so the execution wrapper can decide
/// between re-probing and giving up; everything else is a plugin error.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl From<SessionFailure> for TaskError {
    /// A command failure a plugin propagates untreated surfaces as a plugin
    /// error; a channel loss stays a channel loss.
    fn from(err: SessionFailure) -> Self {
        match err {
            SessionFailure::Session(e) => TaskError::Session(e),
            SessionFailure::Command(e) => TaskError::Plugin(e.into()),
        }
    }
}

impl From<CommandError> for TaskError {
    fn from(err: CommandError) -> Self {
        TaskError::Plugin(err.into())
    }
}

/// Invariant violations in coordinator code. Fatal to the offending message,
/// logged, never surfaced to a plugin.
#[derive(Debug, Clone, Error)]
pub enum LeetError {
    #[error("invalid transition from {from} with trigger {trigger}")]
    InvalidTransition { from: JobStatus, trigger: JobTrigger },
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("unknown search request {0}")]
    UnknownSearch(SearchId),
    #[error("job {0} was already published")]
    AlreadyPublished(JobId),
}
