//! Bounded session worker pool, one per backend.
//!
//! The pool holds exactly `max_sessions` threads sharing one receiver, so
//! the number of concurrently open sessions of a backend can never exceed
//! its declared bound.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use leet_protocol::{ControlMessage, LeetJob};
use tracing::{debug, error};

use crate::executor;

enum PoolJob {
    Run(Arc<LeetJob>),
    Stop,
}

/// Cheap clonable handle used by probe callbacks to enqueue work.
#[derive(Clone)]
pub struct PoolSubmitter {
    tx: Sender<PoolJob>,
}

impl PoolSubmitter {
    /// Hand a job to the pool. Fails only when the pool is shut down; the
    /// job is returned so the caller can publish it.
    pub fn submit(&self, job: Arc<LeetJob>) -> Result<(), Arc<LeetJob>> {
        self.tx.send(PoolJob::Run(job)).map_err(|err| match err.0 {
            PoolJob::Run(job) => job,
            PoolJob::Stop => unreachable!("submit never sends Stop"),
        })
    }
}

pub struct SessionPool {
    tx: Sender<PoolJob>,
    workers: Vec<JoinHandle<()>>,
}

impl SessionPool {
    pub fn new(
        backend_name: &str,
        size: usize,
        coordinator: Sender<ControlMessage>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let rx = Arc::new(Mutex::new(rx));

        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = Arc::clone(&rx);
            let coordinator = coordinator.clone();
            let handle = thread::Builder::new()
                .name(format!("lr-{backend_name}-{idx}"))
                .spawn(move || worker_loop(rx, coordinator))?;
            workers.push(handle);
        }

        Ok(Self { tx, workers })
    }

    pub fn submitter(&self) -> PoolSubmitter {
        PoolSubmitter {
            tx: self.tx.clone(),
        }
    }

    /// Ask every worker to finish its current job and exit, then join them.
    pub fn shutdown(&mut self) {
        for _ in &self.workers {
            let _ = self.tx.send(PoolJob::Stop);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("a session worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<PoolJob>>>, coordinator: Sender<ControlMessage>) {
    loop {
        let next = {
            let guard = rx.lock().expect("session pool receiver lock poisoned");
            guard.recv()
        };
        match next {
            Ok(PoolJob::Run(job)) => executor::execute_job(&job, &coordinator),
            Ok(PoolJob::Stop) | Err(_) => break,
        }
    }
    debug!("session worker finished");
}
