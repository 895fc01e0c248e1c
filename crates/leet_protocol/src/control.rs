//! Control messages drained serially by the coordinator loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::job::LeetJob;
use crate::plugin::Plugin;
use crate::types::{JobId, SearchId};

/// Everything that may land on the coordinator's inbound queue. Backends,
/// scheduler callbacks and the front-end communicate with the coordinator
/// exclusively through these.
pub enum ControlMessage {
    /// Fan a hostname set out to every backend under a fresh search request.
    ScheduleJobs {
        plugin: Box<dyn Plugin>,
        hostnames: Vec<String>,
    },
    /// A search request became ready: the expiry fired or the last backend
    /// completed.
    SearchReady(SearchId),
    /// (Re-)arm the online probe for a job after `delay`.
    ArmProbe {
        job: Arc<LeetJob>,
        delay: Duration,
    },
    /// A job reached its final publication point.
    JobDone(Arc<LeetJob>),
    CancelJob(JobId),
    CancelAllJobs,
    Shutdown,
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ScheduleJobs { .. } => "SCHEDULE_JOBS",
            ControlMessage::SearchReady(_) => "SEARCH_READY",
            ControlMessage::ArmProbe { .. } => "ARM_PROBE",
            ControlMessage::JobDone(_) => "JOB_DONE",
            ControlMessage::CancelJob(_) => "CANCEL_JOB",
            ControlMessage::CancelAllJobs => "CANCEL_ALL_JOBS",
            ControlMessage::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlMessage::{}", self.kind())
    }
}
