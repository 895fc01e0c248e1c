//! The machine and backend capability traits.
//!
//! A backend resolves hostnames to machines; a machine knows whether it can
//! currently take a session and opens one on demand. Plugins and the
//! coordinator depend only on these traits, so backends are plug-replaceable.

use chrono::{DateTime, Utc};

use crate::error::SessionError;
use crate::session::Session;
use crate::types::OsType;

/// One endpoint as seen by one backend.
pub trait Machine: Send + Sync {
    fn hostname(&self) -> &str;

    /// Unique per backend instance, e.g. `CB-prod`.
    fn backend_name(&self) -> &str;

    /// The server this machine was resolved through. Used in conflict logs.
    fn server_url(&self) -> String;

    fn os_type(&self) -> OsType;

    /// Drive letters / mount points, when the backend reports them.
    fn drives(&self) -> Vec<String> {
        Vec::new()
    }

    /// When the endpoint last checked in with its server. Drives conflict
    /// resolution across backends.
    fn last_checkin(&self) -> Option<DateTime<Utc>>;

    /// Whether a session can be opened right now. Recomputed by `refresh`.
    fn can_connect(&self) -> bool;

    /// Re-query the backend for the machine's current state.
    fn refresh(&self) -> Result<(), SessionError>;

    /// Open a live-response session. The returned session closes its remote
    /// channel when dropped.
    fn connect(&self) -> Result<Box<dyn Session>, SessionError>;
}

/// One EDR instance. Implementations resolve hostnames and hand out
/// machines; the runner in `leet_backend` owns the threads around them.
pub trait Backend: Send + 'static {
    /// Unique backend name, stable for the process lifetime.
    fn name(&self) -> &str;

    /// Upper bound on concurrently open sessions for this instance.
    fn max_sessions(&self) -> usize;

    /// Allocate whatever the backend needs to serve searches and sessions.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Release all backend resources. Called once, after the last search.
    fn shutdown(&mut self);

    /// Resolve one hostname to zero or more candidate machines. The caller
    /// picks the candidate with the most-recent check-in.
    fn search_machines(&self, hostname: &str) -> Result<Vec<Box<dyn Machine>>, SessionError>;
}
