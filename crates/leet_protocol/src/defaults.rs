//! Canonical default values shared across the engine.

/// How long a search waits for slow backends before it is forced ready.
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 30;

/// Delay between online probes of an offline machine.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Jobs older than this are published as errors instead of re-armed.
pub const DEFAULT_JOB_EXPIRY_SECS: u64 = 3 * 24 * 60 * 60;

/// Concurrent live-response sessions per backend.
pub const DEFAULT_MAX_SESSIONS: usize = 7;

/// How long a foreground `start_process` may run.
pub const FOREGROUND_PROCESS_TIMEOUT_SECS: u64 = 600;

/// Result message of a job that expired before its machine came online.
pub const JOB_EXPIRED_MESSAGE: &str = "job expired before the machine came online";

/// Result message of a job dropped by cross-backend conflict handling.
pub const CONFLICT_MESSAGE: &str = "machine was found on more than one backend";
