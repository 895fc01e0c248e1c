//! Shared contract between the coordinator, the backends and the plugins.
//!
//! Everything that crosses a crate boundary lives here: identifiers, the job
//! state machine, the search request, the capability traits (`Machine`,
//! `Session`, `Backend`, `Plugin`), the error taxonomy and the control
//! messages drained by the coordinator loop. Backends never hold a reference
//! to the coordinator; they hold a `Sender<ControlMessage>`.

pub mod config;
pub mod control;
pub mod defaults;
pub mod error;
pub mod job;
pub mod machine;
pub mod plugin;
pub mod search;
pub mod session;
pub mod status;
pub mod types;

// Re-export types for convenience
pub use config::LeetConfig;
pub use control::ControlMessage;
pub use error::{CommandError, LeetError, PluginError, SessionError, SessionFailure, TaskError};
pub use job::LeetJob;
pub use machine::{Backend, Machine};
pub use plugin::Plugin;
pub use search::SearchRequest;
pub use session::Session;
pub use status::{JobFsm, JobStatus, JobTrigger};
pub use types::{
    error_row, DirEntry, FileAttribute, JobId, OsType, ProcessEntry, ResultRow, SearchId,
};
