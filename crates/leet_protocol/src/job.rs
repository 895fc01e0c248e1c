//! A job: one (machine, plugin) execution instance with a tracked status.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::LeetError;
use crate::machine::Machine;
use crate::plugin::Plugin;
use crate::status::{JobFsm, JobStatus, JobTrigger};
use crate::types::{JobId, ResultRow};

/// One scheduled plugin execution against one machine.
///
/// Status transitions are single-writer under the internal lock and follow
/// the table in [`crate::status`]. The plugin result is set once, on the
/// success or error path, and never replaced.
pub struct LeetJob {
    id: JobId,
    machine: Box<dyn Machine>,
    plugin: Arc<dyn Plugin>,
    started: DateTime<Utc>,
    started_at: Instant,
    fsm: Mutex<JobFsm>,
    result: Mutex<Option<Vec<ResultRow>>>,
}

impl LeetJob {
    pub fn new(machine: Box<dyn Machine>, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            id: JobId::new(),
            machine,
            plugin,
            started: Utc::now(),
            started_at: Instant::now(),
            fsm: Mutex::new(JobFsm::new()),
            result: Mutex::new(None),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn machine(&self) -> &dyn Machine {
        self.machine.as_ref()
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Whether the job outlived its eligibility window.
    pub fn expired(&self, expiry: Duration) -> bool {
        self.started_at.elapsed() > expiry
    }

    pub fn status(&self) -> JobStatus {
        self.fsm.lock().expect("job state lock poisoned").current()
    }

    fn fire(&self, trigger: JobTrigger) -> Result<JobStatus, LeetError> {
        self.fsm
            .lock()
            .expect("job state lock poisoned")
            .fire(trigger)
    }

    pub fn pending(&self) -> Result<JobStatus, LeetError> {
        self.fire(JobTrigger::Pending)
    }

    pub fn executing(&self) -> Result<JobStatus, LeetError> {
        self.fire(JobTrigger::Executing)
    }

    pub fn cancel(&self) -> Result<JobStatus, LeetError> {
        self.fire(JobTrigger::Cancel)
    }

    pub fn completed(&self) -> Result<JobStatus, LeetError> {
        self.fire(JobTrigger::Completed)
    }

    pub fn error(&self) -> Result<JobStatus, LeetError> {
        self.fire(JobTrigger::Error)
    }

    /// Store the plugin result. The first write wins.
    pub fn set_result(&self, rows: Vec<ResultRow>) {
        let mut guard = self.result.lock().expect("job result lock poisoned");
        if guard.is_some() {
            warn!("job {} already carries a result; keeping the first", self.id);
            return;
        }
        *guard = Some(rows);
    }

    pub fn result(&self) -> Option<Vec<ResultRow>> {
        self.result
            .lock()
            .expect("job result lock poisoned")
            .clone()
    }
}

impl fmt::Debug for LeetJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeetJob")
            .field("id", &self.id)
            .field("hostname", &self.machine.hostname())
            .field("plugin", &self.plugin.name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, TaskError};
    use crate::session::Session;
    use crate::types::OsType;

    struct NullMachine;

    impl Machine for NullMachine {
        fn hostname(&self) -> &str {
            "host-1"
        }

        fn backend_name(&self) -> &str {
            "null"
        }

        fn server_url(&self) -> String {
            "null://".to_string()
        }

        fn os_type(&self) -> OsType {
            OsType::Unknown
        }

        fn last_checkin(&self) -> Option<DateTime<Utc>> {
            None
        }

        fn can_connect(&self) -> bool {
            false
        }

        fn refresh(&self) -> Result<(), SessionError> {
            Ok(())
        }

        fn connect(&self) -> Result<Box<dyn Session>, SessionError> {
            Err(SessionError::fatal("null machine"))
        }
    }

    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn name(&self) -> &str {
            "null"
        }

        fn description(&self) -> &str {
            "does nothing"
        }

        fn help(&self) -> String {
            String::new()
        }

        fn parse_parameters(&mut self, _args: &[String]) -> Result<(), crate::PluginError> {
            Ok(())
        }

        fn run(
            &self,
            _session: &mut dyn Session,
            _machine: &dyn Machine,
        ) -> Result<Vec<ResultRow>, TaskError> {
            Ok(Vec::new())
        }
    }

    fn job() -> LeetJob {
        LeetJob::new(Box::new(NullMachine), Arc::new(NullPlugin))
    }

    #[test]
    fn starts_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(!job.expired(Duration::from_secs(60)));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let job = job();
        assert!(job.completed().is_err());
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[test]
    fn first_result_wins() {
        let job = job();
        job.set_result(crate::error_row("first"));
        job.set_result(crate::error_row("second"));
        let rows = job.result().unwrap();
        assert_eq!(rows[0]["error_message"], "first");
    }
}
