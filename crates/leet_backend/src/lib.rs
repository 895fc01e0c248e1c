//! Backend hosting: the threads around a [`leet_protocol::Backend`].
//!
//! A [`runner::BackendRunner`] owns one backend instance, a search worker
//! that resolves hostname fan-outs, and a session pool bounded by the
//! backend's `max_sessions`. The pool drives [`executor::execute_job`], the
//! single translator from session/plugin failures to job status changes.

pub mod cb;
pub mod executor;
pub mod pool;
pub mod runner;

pub use pool::{PoolSubmitter, SessionPool};
pub use runner::BackendRunner;
