//! The coordinator: serial owner of the job and search tables.
//!
//! A dedicated thread drains the control queue strictly in arrival order, so
//! table mutations need no locking beyond the shared snapshot handle.
//! Everything long-running happens elsewhere: searches on the backend
//! workers, sessions on the per-backend pools, probes on the scheduler
//! workers. All of them report back by posting messages.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use leet_backend::{BackendRunner, PoolSubmitter};
use leet_plugins::PluginRegistry;
use leet_protocol::{
    defaults, error_row, Backend, ControlMessage, JobId, JobStatus, LeetConfig, LeetError,
    LeetJob, Machine, Plugin, SearchId, SearchRequest,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::scheduler::TimerService;

/// Shared callback workers behind the timer service.
const SCHEDULER_WORKERS: usize = 2;

/// One line of the job-status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub hostname: String,
    pub plugin: String,
    pub status: JobStatus,
}

type JobTable = Arc<Mutex<HashMap<JobId, Arc<LeetJob>>>>;

/// The running engine. Owns the coordinator thread; dropping it shuts the
/// whole stack down.
pub struct Leet {
    handle: LeetHandle,
    thread: Option<JoinHandle<()>>,
    completed_rx: Option<Receiver<Arc<LeetJob>>>,
}

impl Leet {
    /// Start every backend, the schedulers and the coordinator thread.
    /// Backends that fail to start are skipped with an error log; if none
    /// survive while some were configured, startup fails.
    pub fn start(backends: Vec<Box<dyn Backend>>, config: LeetConfig) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let requested = backends.len();
        let mut runners = Vec::new();
        for backend in backends {
            match BackendRunner::start(backend, tx.clone()) {
                Ok(runner) => runners.push(runner),
                Err(err) => error!("{:#}", err),
            }
        }
        if requested > 0 && runners.is_empty() {
            anyhow::bail!("none of the {requested} configured backends could be started");
        }

        let submitters = runners
            .iter()
            .map(|runner| (runner.name().to_string(), runner.submitter()))
            .collect();
        let timers = TimerService::start(SCHEDULER_WORKERS)?;
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));

        let coordinator = Coordinator {
            rx,
            tx: tx.clone(),
            runners,
            submitters,
            jobs: Arc::clone(&jobs),
            searches: HashMap::new(),
            timers,
            done_tx,
            config,
        };
        let thread = thread::Builder::new()
            .name("leet-coordinator".to_string())
            .spawn(move || coordinator.run())?;

        Ok(Self {
            handle: LeetHandle {
                tx,
                jobs,
                registry: Arc::new(RwLock::new(PluginRegistry::load())),
            },
            thread: Some(thread),
            completed_rx: Some(done_rx),
        })
    }

    pub fn handle(&self) -> LeetHandle {
        self.handle.clone()
    }

    /// The completion stream. Every job is published here exactly once.
    /// Can be taken once.
    pub fn take_completed(&mut self) -> Option<Receiver<Arc<LeetJob>>> {
        self.completed_rx.take()
    }

    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(ControlMessage::Shutdown);
            if thread.join().is_err() {
                error!("the coordinator thread panicked");
            }
        }
    }
}

impl Drop for Leet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clonable front-end handle. All submissions are non-blocking.
#[derive(Clone)]
pub struct LeetHandle {
    tx: Sender<ControlMessage>,
    jobs: JobTable,
    registry: Arc<RwLock<PluginRegistry>>,
}

impl LeetHandle {
    /// Schedule `plugin` against every hostname that resolves. The plugin's
    /// parameters must already be parsed.
    pub fn schedule_jobs(&self, plugin: Box<dyn Plugin>, hostnames: Vec<String>) {
        debug!("requesting jobs for {} machines", hostnames.len());
        if self
            .tx
            .send(ControlMessage::ScheduleJobs { plugin, hostnames })
            .is_err()
        {
            warn!("the engine is stopped; submission dropped");
        }
    }

    pub fn cancel_job(&self, id: JobId) {
        let _ = self.tx.send(ControlMessage::CancelJob(id));
    }

    pub fn cancel_all_jobs(&self) {
        let _ = self.tx.send(ControlMessage::CancelAllJobs);
    }

    /// Snapshot of the live job table, oldest first.
    pub fn job_status(&self) -> Vec<JobView> {
        let jobs = self.jobs.lock().expect("job table lock poisoned");
        let mut views: Vec<(chrono::DateTime<chrono::Utc>, JobView)> = jobs
            .values()
            .map(|job| {
                (
                    job.started(),
                    JobView {
                        id: job.id(),
                        hostname: job.machine().hostname().to_string(),
                        plugin: job.plugin().name().to_string(),
                        status: job.status(),
                    },
                )
            })
            .collect();
        views.sort_by_key(|(started, view)| (*started, view.id));
        views.into_iter().map(|(_, view)| view).collect()
    }

    pub fn plugin_list(&self) -> Vec<String> {
        self.registry
            .read()
            .expect("plugin registry lock poisoned")
            .names()
    }

    /// A fresh instance of the named plugin, ready for `parse_parameters`.
    pub fn get_plugin(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.registry
            .read()
            .expect("plugin registry lock poisoned")
            .get(name)
    }

    pub fn reload_plugins(&self) {
        debug!("(re)loading plugins");
        self.registry
            .write()
            .expect("plugin registry lock poisoned")
            .reload();
    }
}

struct Coordinator {
    rx: Receiver<ControlMessage>,
    tx: Sender<ControlMessage>,
    runners: Vec<BackendRunner>,
    submitters: HashMap<String, PoolSubmitter>,
    jobs: JobTable,
    searches: HashMap<SearchId, Arc<SearchRequest>>,
    timers: TimerService,
    done_tx: Sender<Arc<LeetJob>>,
    config: LeetConfig,
}

impl Coordinator {
    fn run(mut self) {
        info!("coordinator started with {} backends", self.runners.len());
        while let Ok(message) = self.rx.recv() {
            debug!("received request for {}", message.kind());
            match message {
                ControlMessage::ScheduleJobs { plugin, hostnames } => {
                    self.handle_schedule(Arc::from(plugin), hostnames)
                }
                ControlMessage::SearchReady(id) => self.handle_search_ready(id),
                ControlMessage::ArmProbe { job, delay } => self.arm_probe(job, delay),
                ControlMessage::JobDone(job) => self.handle_job_done(job),
                ControlMessage::CancelJob(id) => self.handle_cancel(id),
                ControlMessage::CancelAllJobs => self.handle_cancel_all(),
                ControlMessage::Shutdown => break,
            }
        }

        self.timers.shutdown();
        for runner in &mut self.runners {
            runner.shutdown();
        }
        info!("coordinator stopped");
    }

    fn handle_schedule(&mut self, plugin: Arc<dyn Plugin>, hostnames: Vec<String>) {
        let request = Arc::new(SearchRequest::new(hostnames, plugin, self.runners.len()));
        info!(
            "search {} covers {} hostnames across {} backends",
            request.id(),
            request.hostnames().len(),
            request.expected_backends()
        );
        self.searches.insert(request.id(), Arc::clone(&request));

        if self.runners.is_empty() {
            request.expire();
            let _ = self.tx.send(ControlMessage::SearchReady(request.id()));
            return;
        }

        for runner in &self.runners {
            runner.search(Arc::clone(&request));
        }

        let tx = self.tx.clone();
        let expiring = Arc::clone(&request);
        self.timers.schedule(self.config.search_timeout, move || {
            if expiring.expire() {
                debug!(
                    "search {} expired before all backends answered",
                    expiring.id()
                );
                let _ = tx.send(ControlMessage::SearchReady(expiring.id()));
            }
        });
    }

    fn handle_search_ready(&mut self, id: SearchId) {
        let Some(request) = self.searches.remove(&id) else {
            error!("{}", LeetError::UnknownSearch(id));
            return;
        };

        let mut by_host: HashMap<String, Vec<Box<dyn Machine>>> = HashMap::new();
        for machine in request.take_machines() {
            by_host
                .entry(machine.hostname().to_lowercase())
                .or_default()
                .push(machine);
        }

        for requested in request.hostnames() {
            if !by_host.contains_key(&requested.to_lowercase()) {
                info!("hostname {} was not found on any backend", requested);
            }
        }

        for (hostname, mut candidates) in by_host {
            if candidates.len() > 1 && !self.config.solve_conflicts {
                warn!("machine {} in conflict; failing the job", hostname);
                let job = Arc::new(LeetJob::new(
                    candidates.swap_remove(0),
                    request.plugin(),
                ));
                if let Err(err) = job.error() {
                    error!("{}", err);
                }
                job.set_result(error_row(defaults::CONFLICT_MESSAGE));
                self.insert_job(Arc::clone(&job));
                let _ = self.tx.send(ControlMessage::JobDone(job));
                continue;
            }

            let machine = if candidates.len() > 1 {
                candidates.sort_by_key(|machine| machine.last_checkin());
                let machine = candidates.pop().expect("non-empty candidate list");
                warn!(
                    "machine {} in conflict; resolution points to usage of instance '{}'",
                    hostname,
                    machine.server_url()
                );
                machine
            } else {
                candidates.pop().expect("non-empty candidate list")
            };

            let job = Arc::new(LeetJob::new(machine, request.plugin()));
            debug!(
                "job {} created for {} on {}",
                job.id(),
                hostname,
                job.machine().backend_name()
            );
            self.insert_job(Arc::clone(&job));
            self.arm_probe(job, Duration::ZERO);
        }
    }

    fn insert_job(&self, job: Arc<LeetJob>) {
        self.jobs
            .lock()
            .expect("job table lock poisoned")
            .insert(job.id(), job);
    }

    /// Arm the online probe for a job. Each probe cycle either submits the
    /// job to its backend's session pool, re-arms itself, or ends the job.
    fn arm_probe(&self, job: Arc<LeetJob>, delay: Duration) {
        let tx = self.tx.clone();
        let submitter = self
            .submitters
            .get(job.machine().backend_name())
            .cloned();
        let poll_interval = self.config.poll_interval;
        let job_expiry = self.config.job_expiry;

        self.timers.schedule(delay, move || {
            probe(job, tx, submitter, poll_interval, job_expiry)
        });
    }

    fn handle_job_done(&mut self, job: Arc<LeetJob>) {
        if self
            .jobs
            .lock()
            .expect("job table lock poisoned")
            .remove(&job.id())
            .is_none()
        {
            error!("{}", LeetError::AlreadyPublished(job.id()));
            return;
        }
        info!("job {} finished with status {}", job.id(), job.status());
        if self.done_tx.send(job).is_err() {
            debug!("completion stream is closed; result dropped");
        }
    }

    fn handle_cancel(&mut self, id: JobId) {
        let job = self
            .jobs
            .lock()
            .expect("job table lock poisoned")
            .get(&id)
            .cloned();
        match job {
            Some(job) => match job.cancel() {
                Ok(_) => info!("job {} cancelled", id),
                Err(err) => warn!("{}", err),
            },
            None => warn!("{}", LeetError::UnknownJob(id)),
        }
    }

    fn handle_cancel_all(&mut self) {
        let jobs: Vec<Arc<LeetJob>> = self
            .jobs
            .lock()
            .expect("job table lock poisoned")
            .values()
            .cloned()
            .collect();
        info!("cancelling {} jobs", jobs.len());
        for job in jobs {
            if let Err(err) = job.cancel() {
                debug!("job {} not cancellable: {}", job.id(), err);
            }
        }
    }
}

/// One online-probe cycle, run on a scheduler worker.
fn probe(
    job: Arc<LeetJob>,
    tx: Sender<ControlMessage>,
    submitter: Option<PoolSubmitter>,
    poll_interval: Duration,
    job_expiry: Duration,
) {
    if job.status() == JobStatus::Cancelled {
        debug!("job {} was cancelled; dropping it from the probe cycle", job.id());
        let _ = tx.send(ControlMessage::JobDone(job));
        return;
    }

    if let Err(err) = job.machine().refresh() {
        if err.stop {
            warn!("giving up job {}: {}", job.id(), err);
            let _ = tx.send(ControlMessage::JobDone(job));
            return;
        }
        debug!("refresh failed for job {}: {}; rearming", job.id(), err);
        rearm_or_expire(job, &tx, poll_interval, job_expiry);
        return;
    }

    // An online machine is always submitted; the eligibility window gates
    // only how long an offline machine keeps being re-probed.
    if !job.machine().can_connect() {
        debug!("machine for job {} is offline; rescheduling", job.id());
        rearm_or_expire(job, &tx, poll_interval, job_expiry);
        return;
    }

    debug!("machine for job {} is online; attempting connection", job.id());
    match submitter {
        Some(submitter) => {
            if let Err(job) = submitter.submit(job) {
                warn!("session pool for job {} is gone", job.id());
                let _ = tx.send(ControlMessage::JobDone(job));
            }
        }
        None => {
            error!(
                "no backend registered under {}; failing job {}",
                job.machine().backend_name(),
                job.id()
            );
            if let Err(err) = job.error() {
                error!("{}", err);
            }
            job.set_result(error_row("the owning backend is gone"));
            let _ = tx.send(ControlMessage::JobDone(job));
        }
    }
}

/// Re-arm the probe for a machine that could not be reached, or end the job
/// once it has been offline past its eligibility window.
fn rearm_or_expire(
    job: Arc<LeetJob>,
    tx: &Sender<ControlMessage>,
    poll_interval: Duration,
    job_expiry: Duration,
) {
    if job.expired(job_expiry) {
        info!("{} for job {}", defaults::JOB_EXPIRED_MESSAGE, job.id());
        if let Err(err) = job.error() {
            error!("{}", err);
        }
        job.set_result(error_row(defaults::JOB_EXPIRED_MESSAGE));
        let _ = tx.send(ControlMessage::JobDone(job));
        return;
    }
    let _ = tx.send(ControlMessage::ArmProbe {
        job,
        delay: poll_interval,
    });
}
