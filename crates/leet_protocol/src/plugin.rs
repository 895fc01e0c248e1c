//! The plugin contract.

use crate::error::{PluginError, TaskError};
use crate::machine::Machine;
use crate::session::Session;
use crate::types::ResultRow;

/// A parameterised unit of remote work producing tabular output.
///
/// `run` must be idempotent: a retry may observe partial work left by a
/// prior attempt and has to reconcile it (check existence before creating,
/// check size before downloading). Every returned row carries the same key
/// set. Failures surface only as [`TaskError`]; session losses pass through,
/// everything plugin-originated is a [`PluginError`].
pub trait Plugin: Send + Sync {
    /// Unique plugin name, as typed by the user.
    fn name(&self) -> &str;

    /// One-line description shown in the plugin list.
    fn description(&self) -> &str;

    /// Full usage text, including the argument schema.
    fn help(&self) -> String;

    /// Validate and store user-supplied parameters. Called once, before the
    /// instance is shared across the jobs of a search.
    fn parse_parameters(&mut self, args: &[String]) -> Result<(), PluginError>;

    /// Execute against an open session.
    fn run(
        &self,
        session: &mut dyn Session,
        machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError>;
}
