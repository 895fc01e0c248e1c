//! Simulated EDR backend for the test suites.
//!
//! `SimBackend` resolves scripted machines, `SimMachine` flips online after a
//! configurable number of probes, and `SimSession` serves a virtual
//! filesystem with optional failure injection. Session open/close counters
//! make the resource invariants observable.

pub mod plugins;

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use leet_protocol::{
    Backend, CommandError, DirEntry, FileAttribute, Machine, OsType, ProcessEntry, Session,
    SessionError, SessionFailure,
};

/// Fixed timestamp used for every virtual filesystem entry.
pub fn sim_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 6, 1, 12, 0, 0).unwrap()
}

/// Session counters shared by all machines of one backend.
#[derive(Default)]
pub struct SimCounters {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl SimCounters {
    fn note_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
    }

    fn note_close(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn currently_open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently open sessions.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

enum SimNode {
    Dir,
    File(Vec<u8>),
}

/// Scripted state of one endpoint, shared between the backend that resolves
/// it and the test that asserts on it.
pub struct SimMachineState {
    hostname: String,
    os: OsType,
    last_checkin: Mutex<DateTime<Utc>>,
    online_after: usize,
    refreshes: AtomicUsize,
    online: AtomicBool,
    fs: Mutex<BTreeMap<String, SimNode>>,
    processes: Mutex<Vec<ProcessEntry>>,
    op_failures: Mutex<VecDeque<SessionFailure>>,
    connect_failures: Mutex<VecDeque<SessionError>>,
    counters: SimCounters,
    commands: Mutex<Vec<String>>,
}

impl SimMachineState {
    /// A Windows machine with a `c:` drive, online on the first probe.
    pub fn new(hostname: &str) -> Arc<Self> {
        Self::online_after(hostname, 0)
    }

    /// A machine that stays offline for the first `probes` refreshes.
    pub fn online_after(hostname: &str, probes: usize) -> Arc<Self> {
        let state = Self {
            hostname: hostname.to_string(),
            os: OsType::Windows,
            last_checkin: Mutex::new(sim_time()),
            online_after: probes,
            refreshes: AtomicUsize::new(0),
            online: AtomicBool::new(false),
            fs: Mutex::new(BTreeMap::new()),
            processes: Mutex::new(Vec::new()),
            op_failures: Mutex::new(VecDeque::new()),
            connect_failures: Mutex::new(VecDeque::new()),
            counters: SimCounters::default(),
            commands: Mutex::new(Vec::new()),
        };
        state.fs.lock().unwrap().insert("c:".to_string(), SimNode::Dir);
        Arc::new(state)
    }

    pub fn set_checkin(&self, checkin: DateTime<Utc>) -> &Self {
        *self.last_checkin.lock().unwrap() = checkin;
        self
    }

    pub fn add_dir(&self, path: &str) -> &Self {
        self.fs
            .lock()
            .unwrap()
            .insert(path.to_string(), SimNode::Dir);
        self
    }

    pub fn add_file(&self, path: &str, content: &[u8]) -> &Self {
        self.fs
            .lock()
            .unwrap()
            .insert(path.to_string(), SimNode::File(content.to_vec()));
        self
    }

    pub fn add_process(&self, username: &str, pid: u32, ppid: u32, path: &str) -> &Self {
        self.processes.lock().unwrap().push(ProcessEntry {
            username: username.to_string(),
            pid,
            ppid,
            start_time: sim_time(),
            command_line: path.to_string(),
            path: path.to_string(),
        });
        self
    }

    /// Fail the next session operation with `failure`.
    pub fn queue_op_failure(&self, failure: SessionFailure) -> &Self {
        self.op_failures.lock().unwrap().push_back(failure);
        self
    }

    /// Fail the next `connect` with `error`.
    pub fn queue_connect_failure(&self, error: SessionError) -> &Self {
        self.connect_failures.lock().unwrap().push_back(error);
        self
    }

    pub fn counters(&self) -> &SimCounters {
        &self.counters
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn has_file(&self, path: &str) -> bool {
        matches!(self.fs.lock().unwrap().get(path), Some(SimNode::File(_)))
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn sep(&self) -> char {
        self.os.path_separator()
    }

    fn parent_of(path: &str, sep: char) -> Option<&str> {
        path.rsplit_once(sep).map(|(parent, _)| parent)
    }
}

/// A machine handle as one backend sees it.
pub struct SimMachine {
    state: Arc<SimMachineState>,
    backend_name: String,
    server_url: String,
    backend_counters: Arc<SimCounters>,
}

impl Machine for SimMachine {
    fn hostname(&self) -> &str {
        &self.state.hostname
    }

    fn backend_name(&self) -> &str {
        &self.backend_name
    }

    fn server_url(&self) -> String {
        self.server_url.clone()
    }

    fn os_type(&self) -> OsType {
        self.state.os
    }

    fn last_checkin(&self) -> Option<DateTime<Utc>> {
        Some(*self.state.last_checkin.lock().unwrap())
    }

    fn can_connect(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    fn refresh(&self) -> Result<(), SessionError> {
        let done = self.state.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .online
            .store(done > self.state.online_after, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn Session>, SessionError> {
        if let Some(err) = self.state.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.state.counters.note_open();
        self.backend_counters.note_open();
        Ok(Box::new(SimSession {
            state: Arc::clone(&self.state),
            backend_counters: Arc::clone(&self.backend_counters),
        }))
    }
}

/// A session over the machine's virtual filesystem.
pub struct SimSession {
    state: Arc<SimMachineState>,
    backend_counters: Arc<SimCounters>,
}

impl SimSession {
    fn check_injected(&self) -> Result<(), SessionFailure> {
        match self.state.op_failures.lock().unwrap().pop_front() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn entry(&self, name: &str, node: &SimNode) -> DirEntry {
        let ts = sim_time();
        DirEntry {
            name: name.to_string(),
            size: match node {
                SimNode::Dir => 0,
                SimNode::File(content) => content.len() as u64,
            },
            attributes: match node {
                SimNode::Dir => vec![FileAttribute::Directory],
                SimNode::File(_) => Vec::new(),
            },
            created: ts,
            accessed: ts,
            modified: ts,
        }
    }
}

impl Session for SimSession {
    fn os_type(&self) -> OsType {
        self.state.os
    }

    fn list_processes(&mut self) -> Result<Vec<ProcessEntry>, SessionFailure> {
        self.check_injected()?;
        Ok(self.state.processes.lock().unwrap().clone())
    }

    fn get_file(&mut self, remote_path: &str) -> Result<Vec<u8>, SessionFailure> {
        self.check_injected()?;
        match self.state.fs.lock().unwrap().get(remote_path) {
            Some(SimNode::File(content)) => Ok(content.clone()),
            _ => Err(CommandError::new(format!("no such file: {remote_path}")).into()),
        }
    }

    fn put_file_raw(
        &mut self,
        data: &mut dyn Read,
        remote_path: &str,
    ) -> Result<(), SessionFailure> {
        self.check_injected()?;
        let sep = self.state.sep();
        let parent = SimMachineState::parent_of(remote_path, sep)
            .ok_or_else(|| CommandError::new("not an absolute path"))?;
        let mut fs = self.state.fs.lock().unwrap();
        if !matches!(fs.get(parent), Some(SimNode::Dir)) {
            return Err(CommandError::new(format!("no such directory: {parent}")).into());
        }
        let mut content = Vec::new();
        data.read_to_end(&mut content)
            .map_err(|err| CommandError::new(err.to_string()))?;
        fs.insert(remote_path.to_string(), SimNode::File(content));
        Ok(())
    }

    fn delete_file(&mut self, remote_path: &str) -> Result<(), SessionFailure> {
        self.check_injected()?;
        let mut fs = self.state.fs.lock().unwrap();
        if !fs.contains_key(remote_path) {
            return Err(CommandError::new(format!("no such path: {remote_path}")).into());
        }
        let sep = self.state.sep();
        let prefix = format!("{remote_path}{sep}");
        fs.retain(|path, _| path.as_str() != remote_path && !path.starts_with(&prefix));
        Ok(())
    }

    fn list_dir(&mut self, remote_path: &str) -> Result<Vec<DirEntry>, SessionFailure> {
        self.check_injected()?;
        let sep = self.state.sep();
        let parent = remote_path.trim_end_matches(sep);
        let fs = self.state.fs.lock().unwrap();
        if !matches!(fs.get(parent), Some(SimNode::Dir)) {
            return Err(CommandError::new(format!("no such directory: {parent}")).into());
        }
        let mut entries = Vec::new();
        for (path, node) in fs.iter() {
            if SimMachineState::parent_of(path, sep) == Some(parent) {
                let name = path.rsplit(sep).next().unwrap_or_default();
                entries.push(self.entry(name, node));
            }
        }
        Ok(entries)
    }

    fn make_dir_single(&mut self, remote_path: &str) -> Result<(), SessionFailure> {
        self.check_injected()?;
        let sep = self.state.sep();
        let parent = SimMachineState::parent_of(remote_path, sep)
            .ok_or_else(|| CommandError::new("not an absolute path"))?;
        let mut fs = self.state.fs.lock().unwrap();
        if !matches!(fs.get(parent), Some(SimNode::Dir)) {
            return Err(CommandError::new(format!("no such directory: {parent}")).into());
        }
        fs.insert(remote_path.to_string(), SimNode::Dir);
        Ok(())
    }

    fn start_process(
        &mut self,
        cmd: &str,
        _cwd: Option<&str>,
        background: bool,
    ) -> Result<Option<String>, SessionFailure> {
        self.check_injected()?;
        self.state.commands.lock().unwrap().push(cmd.to_string());
        if background {
            Ok(None)
        } else {
            Ok(Some(String::new()))
        }
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.state.counters.note_close();
        self.backend_counters.note_close();
    }
}

/// A machine double for tests that never touch the backend.
pub struct NullMachine;

impl Machine for NullMachine {
    fn hostname(&self) -> &str {
        "null-host"
    }

    fn backend_name(&self) -> &str {
        "null"
    }

    fn server_url(&self) -> String {
        "null://".to_string()
    }

    fn os_type(&self) -> OsType {
        OsType::Windows
    }

    fn last_checkin(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn can_connect(&self) -> bool {
        false
    }

    fn refresh(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn Session>, SessionError> {
        Err(SessionError::fatal("null machine takes no sessions"))
    }
}

/// A session double that rejects every operation.
pub struct NullSession;

impl Session for NullSession {
    fn os_type(&self) -> OsType {
        OsType::Windows
    }

    fn list_processes(&mut self) -> Result<Vec<ProcessEntry>, SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn get_file(&mut self, _remote_path: &str) -> Result<Vec<u8>, SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn put_file_raw(
        &mut self,
        _data: &mut dyn Read,
        _remote_path: &str,
    ) -> Result<(), SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn delete_file(&mut self, _remote_path: &str) -> Result<(), SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn list_dir(&mut self, _remote_path: &str) -> Result<Vec<DirEntry>, SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn make_dir_single(&mut self, _remote_path: &str) -> Result<(), SessionFailure> {
        Err(CommandError::new("null session").into())
    }

    fn start_process(
        &mut self,
        _cmd: &str,
        _cwd: Option<&str>,
        _background: bool,
    ) -> Result<Option<String>, SessionFailure> {
        Err(CommandError::new("null session").into())
    }
}

/// A scripted backend instance.
pub struct SimBackend {
    name: String,
    url: String,
    max_sessions: usize,
    machines: Vec<Arc<SimMachineState>>,
    search_delay: Duration,
    counters: Arc<SimCounters>,
    started: AtomicBool,
}

impl SimBackend {
    pub fn new(name: &str, max_sessions: usize) -> Self {
        Self {
            name: name.to_string(),
            url: format!("https://{}.example", name.to_lowercase()),
            max_sessions,
            machines: Vec::new(),
            search_delay: Duration::ZERO,
            counters: Arc::new(SimCounters::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_machine(mut self, machine: Arc<SimMachineState>) -> Self {
        self.machines.push(machine);
        self
    }

    /// Make every search take at least `delay`, to exercise expiry races.
    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn counters(&self) -> Arc<SimCounters> {
        Arc::clone(&self.counters)
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn search_machines(&self, hostname: &str) -> Result<Vec<Box<dyn Machine>>, SessionError> {
        if !self.search_delay.is_zero() {
            std::thread::sleep(self.search_delay);
        }
        Ok(self
            .machines
            .iter()
            .filter(|m| m.hostname.eq_ignore_ascii_case(hostname))
            .map(|m| {
                Box::new(SimMachine {
                    state: Arc::clone(m),
                    backend_name: self.name.clone(),
                    server_url: self.url.clone(),
                    backend_counters: Arc::clone(&self.counters),
                }) as Box<dyn Machine>
            })
            .collect())
    }
}
