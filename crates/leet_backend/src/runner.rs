//! One running backend: its search worker and its session pool.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use chrono::{DateTime, Utc};
use leet_protocol::{Backend, ControlMessage, Machine, SearchRequest};
use tracing::{debug, error, warn};

use crate::pool::{PoolSubmitter, SessionPool};

enum SearchWork {
    Search(Arc<SearchRequest>),
    Stop,
}

/// Owns the threads of one backend instance. The coordinator keeps one
/// runner per configured backend and talks to it only through `search` and
/// the pool submitter; everything flows back as control messages.
pub struct BackendRunner {
    name: String,
    search_tx: Sender<SearchWork>,
    search_thread: Option<JoinHandle<()>>,
    pool: SessionPool,
}

impl BackendRunner {
    /// Start the backend and its threads. The backend object moves onto the
    /// search worker, which also drives its shutdown.
    pub fn start(
        mut backend: Box<dyn Backend>,
        coordinator: Sender<ControlMessage>,
    ) -> anyhow::Result<Self> {
        backend
            .start()
            .with_context(|| format!("backend {} failed to start", backend.name()))?;

        let name = backend.name().to_string();
        let pool = SessionPool::new(&name, backend.max_sessions(), coordinator.clone())?;

        let (search_tx, search_rx) = mpsc::channel();
        let thread_name = format!("search-{name}");
        let search_thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || search_loop(backend, search_rx, coordinator))?;

        Ok(Self {
            name,
            search_tx,
            search_thread: Some(search_thread),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submitter(&self) -> PoolSubmitter {
        self.pool.submitter()
    }

    /// Queue a search request for asynchronous resolution.
    pub fn search(&self, request: Arc<SearchRequest>) {
        if self.search_tx.send(SearchWork::Search(request)).is_err() {
            warn!("backend {} is gone; search request dropped", self.name);
        }
    }

    /// Stop the search worker and drain the session pool.
    pub fn shutdown(&mut self) {
        debug!("shutting down backend {}", self.name);
        let _ = self.search_tx.send(SearchWork::Stop);
        if let Some(handle) = self.search_thread.take() {
            if handle.join().is_err() {
                error!("search worker of backend {} panicked", self.name);
            }
        }
        self.pool.shutdown();
    }
}

fn search_loop(
    mut backend: Box<dyn Backend>,
    rx: mpsc::Receiver<SearchWork>,
    coordinator: Sender<ControlMessage>,
) {
    loop {
        match rx.recv() {
            Ok(SearchWork::Search(request)) => {
                resolve_search(backend.as_ref(), &request, &coordinator)
            }
            Ok(SearchWork::Stop) | Err(_) => break,
        }
    }
    backend.shutdown();
    debug!("backend {} stopped", backend.name());
}

fn resolve_search(
    backend: &dyn Backend,
    request: &Arc<SearchRequest>,
    coordinator: &Sender<ControlMessage>,
) {
    debug!(
        "search request for {} machines on {}",
        request.hostnames().len(),
        backend.name()
    );

    let mut found = Vec::new();
    for hostname in request.hostnames() {
        match backend.search_machines(hostname) {
            Ok(candidates) => {
                if let Some(machine) = most_recent_checkin(candidates) {
                    found.push(machine);
                }
            }
            Err(err) => warn!(
                "resolving {} on {} failed: {}",
                hostname,
                backend.name(),
                err
            ),
        }
    }
    debug!(
        "search finished, {}/{} found on {}",
        found.len(),
        request.hostnames().len(),
        backend.name()
    );

    request.append_machines(found);
    if request.complete_backend(backend.name()) {
        let _ = coordinator.send(ControlMessage::SearchReady(request.id()));
    }
}

/// Of a backend's candidate handles for one hostname, keep the one with the
/// most-recent check-in. Candidates without a check-in lose to any that have
/// one.
pub fn most_recent_checkin(candidates: Vec<Box<dyn Machine>>) -> Option<Box<dyn Machine>> {
    let mut best: Option<Box<dyn Machine>> = None;
    let mut best_checkin: Option<DateTime<Utc>> = None;
    for candidate in candidates {
        let checkin = candidate.last_checkin();
        if best.is_none() || checkin > best_checkin {
            best_checkin = checkin;
            best = Some(candidate);
        }
    }
    best
}
