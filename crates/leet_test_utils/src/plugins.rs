//! Minimal plugins with controllable behaviour for engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leet_protocol::{Machine, Plugin, PluginError, ResultRow, Session, TaskError};
use serde_json::json;

fn row(pairs: &[(&str, serde_json::Value)]) -> ResultRow {
    let mut row = ResultRow::new();
    for (key, value) in pairs {
        row.insert(key.to_string(), value.clone());
    }
    row
}

/// Emits one row naming the machine it ran on.
pub struct MarkerPlugin;

impl Plugin for MarkerPlugin {
    fn name(&self) -> &str {
        "marker"
    }

    fn description(&self) -> &str {
        "Emits one row per run."
    }

    fn help(&self) -> String {
        "marker (no parameters)".to_string()
    }

    fn parse_parameters(&mut self, _args: &[String]) -> Result<(), PluginError> {
        Ok(())
    }

    fn run(
        &self,
        _session: &mut dyn Session,
        machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        Ok(vec![row(&[
            ("Hostname", json!(machine.hostname())),
            ("Status", json!("ok")),
        ])])
    }
}

/// Holds its session open for a fixed time and records how many runs were
/// in flight at once.
pub struct SlowPlugin {
    hold: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl SlowPlugin {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// High-water mark of concurrent runs.
    pub fn max_active(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_active)
    }
}

impl Plugin for SlowPlugin {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps inside the session."
    }

    fn help(&self) -> String {
        "slow (no parameters)".to_string()
    }

    fn parse_parameters(&mut self, _args: &[String]) -> Result<(), PluginError> {
        Ok(())
    }

    fn run(
        &self,
        _session: &mut dyn Session,
        machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.hold);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![row(&[("Hostname", json!(machine.hostname()))])])
    }
}

/// Always fails with a plugin error.
pub struct FailingPlugin {
    pub message: String,
}

impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    fn description(&self) -> &str {
        "Fails every run."
    }

    fn help(&self) -> String {
        "failing (no parameters)".to_string()
    }

    fn parse_parameters(&mut self, _args: &[String]) -> Result<(), PluginError> {
        Ok(())
    }

    fn run(
        &self,
        _session: &mut dyn Session,
        _machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        Err(PluginError::new(self.message.clone()).into())
    }
}

/// Touches the session once, so injected failures fire, then emits a row.
pub struct TouchPlugin;

impl Plugin for TouchPlugin {
    fn name(&self) -> &str {
        "touch"
    }

    fn description(&self) -> &str {
        "Performs one session operation."
    }

    fn help(&self) -> String {
        "touch (no parameters)".to_string()
    }

    fn parse_parameters(&mut self, _args: &[String]) -> Result<(), PluginError> {
        Ok(())
    }

    fn run(
        &self,
        session: &mut dyn Session,
        machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        let processes = session.list_processes()?;
        Ok(vec![row(&[
            ("Hostname", json!(machine.hostname())),
            ("Processes", json!(processes.len())),
        ])])
    }
}
