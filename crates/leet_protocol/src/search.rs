//! A batched hostname resolution across all configured backends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::machine::Machine;
use crate::plugin::Plugin;
use crate::types::SearchId;

struct SearchState {
    machines: Vec<Box<dyn Machine>>,
    completed_backends: HashSet<String>,
    ready: bool,
    completed_at: Option<DateTime<Utc>>,
}

/// One fan-out query for a set of hostnames.
///
/// Backends append their findings and register completion; the request
/// becomes ready when every expected backend answered or the expiry timer
/// fired, whichever happens first. Readiness is monotonic and freezes the
/// found-machine list: late appends are ignored.
pub struct SearchRequest {
    id: SearchId,
    created: DateTime<Utc>,
    hostnames: Vec<String>,
    plugin: Arc<dyn Plugin>,
    expected_backends: usize,
    state: Mutex<SearchState>,
}

impl SearchRequest {
    pub fn new(hostnames: Vec<String>, plugin: Arc<dyn Plugin>, expected_backends: usize) -> Self {
        Self {
            id: SearchId::new(),
            created: Utc::now(),
            hostnames,
            plugin,
            expected_backends,
            state: Mutex::new(SearchState {
                machines: Vec::new(),
                completed_backends: HashSet::new(),
                ready: false,
                completed_at: None,
            }),
        }
    }

    pub fn id(&self) -> SearchId {
        self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn plugin(&self) -> Arc<dyn Plugin> {
        Arc::clone(&self.plugin)
    }

    pub fn expected_backends(&self) -> usize {
        self.expected_backends
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().completed_at
    }

    /// Append machines found by one backend. Safe after readiness: the list
    /// is frozen, the append is dropped.
    pub fn append_machines(&self, found: Vec<Box<dyn Machine>>) {
        let mut state = self.lock();
        if state.ready {
            debug!(
                "search {} already ready; dropping {} late machines",
                self.id,
                found.len()
            );
            return;
        }
        state.machines.extend(found);
    }

    /// Register a backend as done with this search. Returns true iff this
    /// registration is the one that made the request ready.
    pub fn complete_backend(&self, backend_name: &str) -> bool {
        let mut state = self.lock();
        state.completed_backends.insert(backend_name.to_string());
        if !state.ready && state.completed_backends.len() >= self.expected_backends {
            Self::mark_ready(&mut state);
            return true;
        }
        false
    }

    /// Force readiness from the expiry timer. Returns true iff this call
    /// flipped the flag.
    pub fn expire(&self) -> bool {
        let mut state = self.lock();
        if state.ready {
            return false;
        }
        Self::mark_ready(&mut state);
        true
    }

    /// Drain the frozen machine list for job creation.
    pub fn take_machines(&self) -> Vec<Box<dyn Machine>> {
        std::mem::take(&mut self.lock().machines)
    }

    fn mark_ready(state: &mut SearchState) {
        state.ready = true;
        state.completed_at = Some(Utc::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SearchState> {
        self.state.lock().expect("search state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::session::Session;
    use crate::types::ResultRow;

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

    fn request(expected: usize) -> SearchRequest {
        SearchRequest::new(vec!["h1".to_string()], Arc::new(NullPlugin), expected)
    }

    #[test]
    fn last_backend_flips_readiness_exactly_once() {
        let req = request(2);
        assert!(!req.complete_backend("b1"));
        assert!(!req.is_ready());
        assert!(req.complete_backend("b2"));
        assert!(req.is_ready());
        // duplicate and late registrations change nothing
        assert!(!req.complete_backend("b2"));
        assert!(!req.complete_backend("b3"));
    }

    #[test]
    fn expiry_flips_once_and_wins_races() {
        let req = request(2);
        assert!(req.expire());
        assert!(req.is_ready());
        assert!(!req.expire());
        // a backend completing after expiry must not report readiness again
        assert!(!req.complete_backend("b1"));
        assert!(!req.complete_backend("b2"));
    }

    #[test]
    fn readiness_is_monotonic() {
        let req = request(1);
        assert!(req.complete_backend("b1"));
        for _ in 0..3 {
            assert!(req.is_ready());
            req.expire();
        }
    }

    #[test]
    fn appends_after_readiness_are_dropped() {
        let req = request(1);
        req.append_machines(Vec::new());
        req.complete_backend("b1");
        req.append_machines(Vec::new());
        assert!(req.take_machines().is_empty());
    }
}
