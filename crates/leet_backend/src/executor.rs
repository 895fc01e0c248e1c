//! The plugin-execution wrapper.
//!
//! Runs on a session-pool worker and is the only place where session and
//! plugin failures turn into job status changes. The session is acquired in
//! this scope and released on every exit path, including panics inside the
//! plugin body, because it closes on drop.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use leet_protocol::{error_row, ControlMessage, JobStatus, LeetJob, TaskError};
use tracing::{debug, error, warn};

/// Open a session, run the job's plugin over it and report back to the
/// coordinator.
pub fn execute_job(job: &Arc<LeetJob>, coordinator: &Sender<ControlMessage>) {
    // A cancel that lands between probe fire and worker pickup aborts the
    // work before any session is opened.
    if job.status() == JobStatus::Cancelled {
        debug!("job {} cancelled before pickup; not opening a session", job.id());
        post_done(coordinator, job);
        return;
    }

    let mut session = match job.machine().connect() {
        Ok(session) => session,
        Err(err) if err.stop => {
            warn!("giving up job {}: {}", job.id(), err);
            post_done(coordinator, job);
            return;
        }
        Err(err) => {
            debug!("session for job {} did not open: {}; reprobing", job.id(), err);
            post_probe(coordinator, job);
            return;
        }
    };
    debug!("session for job {} ready, starting execution", job.id());

    // A cancel racing the session setup is absorbed here: the state machine
    // keeps the job in Cancelled and the work is allowed to finish.
    if let Err(err) = job.executing() {
        error!("{}", err);
        post_done(coordinator, job);
        return;
    }

    match job.plugin().run(session.as_mut(), job.machine()) {
        Ok(rows) => {
            match job.completed() {
                Ok(_) => debug!("job {} was successful", job.id()),
                Err(err) => error!("{}", err),
            }
            job.set_result(rows);
            post_done(coordinator, job);
        }
        Err(TaskError::Plugin(err)) => {
            warn!("plugin failed on job {}: {}", job.id(), err);
            if job.status() != JobStatus::Cancelled {
                if let Err(err) = job.error() {
                    error!("{}", err);
                }
            }
            job.set_result(error_row(err.0));
            post_done(coordinator, job);
        }
        Err(TaskError::Session(err)) if err.stop => {
            warn!("session lost for job {}, not retrying: {}", job.id(), err);
            post_done(coordinator, job);
        }
        Err(TaskError::Session(err)) => {
            debug!("session lost for job {}: {}; rescheduling", job.id(), err);
            match job.pending() {
                Ok(_) => {
                    drop(session);
                    post_probe(coordinator, job);
                    return;
                }
                // Cancelled while the session was dying: publish as-is.
                Err(_) => post_done(coordinator, job),
            }
        }
    }
}

fn post_done(coordinator: &Sender<ControlMessage>, job: &Arc<LeetJob>) {
    if coordinator
        .send(ControlMessage::JobDone(Arc::clone(job)))
        .is_err()
    {
        warn!("coordinator queue closed; job {} result is lost", job.id());
    }
}

fn post_probe(coordinator: &Sender<ControlMessage>, job: &Arc<LeetJob>) {
    if coordinator
        .send(ControlMessage::ArmProbe {
            job: Arc::clone(job),
            delay: Duration::ZERO,
        })
        .is_err()
    {
        warn!("coordinator queue closed; job {} cannot be rescheduled", job.id());
    }
}
