//! End-to-end tests of the engine against the simulated backend: search
//! fan-out, online probing, session dispatch, conflict handling,
//! cancellation and the completion stream.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::TimeZone;
use leet_coordinator::Leet;
use leet_protocol::{
    defaults, Backend, JobStatus, LeetConfig, LeetJob, SessionError, SessionFailure,
};
use leet_test_utils::plugins::{FailingPlugin, MarkerPlugin, SlowPlugin, TouchPlugin};
use leet_test_utils::{SimBackend, SimMachineState};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const GRACE: Duration = Duration::from_millis(300);

fn test_config() -> LeetConfig {
    LeetConfig {
        search_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(60),
        job_expiry: Duration::from_secs(30),
        max_sessions: 2,
        solve_conflicts: true,
    }
}

fn start(backends: Vec<Box<dyn Backend>>, config: LeetConfig) -> (Leet, Receiver<Arc<LeetJob>>) {
    let mut leet = Leet::start(backends, config).expect("engine start");
    let completed = leet.take_completed().expect("completion stream");
    (leet, completed)
}

fn assert_stream_is_quiet(completed: &Receiver<Arc<LeetJob>>) {
    assert!(
        completed.recv_timeout(GRACE).is_err(),
        "unexpected extra publication"
    );
}

#[test]
fn happy_path_single_backend() {
    let state = SimMachineState::new("H1");
    state
        .add_dir(r"c:\tools")
        .add_file(r"c:\notes.txt", b"hello");
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    let handle = leet.handle();
    let mut plugin = handle.get_plugin("dirlist").expect("dirlist registered");
    plugin
        .parse_parameters(&["--path".to_string(), r"c:\".to_string()])
        .unwrap();
    handle.schedule_jobs(plugin, vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.machine().hostname(), "H1");

    let rows = job.result().expect("dirlist rows");
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let keys: Vec<&String> = row.keys().collect();
        assert_eq!(
            keys,
            vec![
                "Access ts",
                "Write ts",
                "Created ts",
                "Filename",
                "Attributes",
                "Size"
            ]
        );
    }

    assert_stream_is_quiet(&completed);
    assert_eq!(counters.opened(), 1);
    assert_eq!(counters.closed(), 1);
    assert!(handle.job_status().is_empty());
}

#[test]
fn offline_machine_completes_after_a_later_probe() {
    let state = SimMachineState::online_after("H1", 1);
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let config = test_config();
    let poll_interval = config.poll_interval;
    let (leet, completed) = start(vec![Box::new(backend)], config);

    let submitted = Instant::now();
    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    // the first probe saw the machine offline, so at least one poll interval
    // must have passed and at least two refreshes must have happened
    assert!(submitted.elapsed() >= poll_interval);
    assert!(state.refreshes() >= 2);
    assert_stream_is_quiet(&completed);
}

#[test]
fn conflict_resolves_to_the_most_recent_checkin() {
    let older = SimMachineState::new("H1");
    older.set_checkin(chrono::Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap());
    let newer = SimMachineState::new("H1");
    newer.set_checkin(chrono::Utc.with_ymd_and_hms(2019, 9, 1, 0, 0, 0).unwrap());

    let b1 = SimBackend::new("B1", 2).with_machine(older);
    let b2 = SimBackend::new("B2", 2).with_machine(newer);
    let (leet, completed) = start(vec![Box::new(b1), Box::new(b2)], test_config());

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.machine().backend_name(), "B2");
    assert_stream_is_quiet(&completed);
}

#[test]
fn conflict_without_resolution_fails_the_job() {
    let b1 = SimBackend::new("B1", 2).with_machine(SimMachineState::new("H1"));
    let b2 = SimBackend::new("B2", 2).with_machine(SimMachineState::new("H1"));
    let mut config = test_config();
    config.solve_conflicts = false;
    let (leet, completed) = start(vec![Box::new(b1), Box::new(b2)], config);

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    assert_eq!(job.status(), JobStatus::Error);
    let rows = job.result().expect("error row");
    assert_eq!(rows[0]["error_message"], defaults::CONFLICT_MESSAGE);
    assert_stream_is_quiet(&completed);
}

#[test]
fn cancel_while_pending_never_opens_a_session() {
    let state = SimMachineState::online_after("H1", 1_000_000);
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());
    let handle = leet.handle();

    handle.schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    // wait for the job to materialise in the table
    let deadline = Instant::now() + RECV_TIMEOUT;
    let job_id = loop {
        if let Some(view) = handle.job_status().first() {
            break view.id;
        }
        assert!(Instant::now() < deadline, "job never appeared");
        std::thread::sleep(Duration::from_millis(10));
    };
    handle.cancel_job(job_id);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    assert_eq!(job.id(), job_id);
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert_eq!(counters.opened(), 0);
    assert_stream_is_quiet(&completed);
}

#[test]
fn cancel_during_execution_lets_the_work_finish() {
    let state = SimMachineState::new("H1");
    let backend = SimBackend::new("B1", 2).with_machine(state);
    let (leet, completed) = start(vec![Box::new(backend)], test_config());
    let handle = leet.handle();

    handle.schedule_jobs(
        Box::new(SlowPlugin::new(Duration::from_millis(400))),
        vec!["H1".to_string()],
    );

    let deadline = Instant::now() + RECV_TIMEOUT;
    let job_id = loop {
        if let Some(view) = handle
            .job_status()
            .iter()
            .find(|view| view.status == JobStatus::Executing)
        {
            break view.id;
        }
        assert!(Instant::now() < deadline, "job never started executing");
        std::thread::sleep(Duration::from_millis(10));
    };
    handle.cancel_job(job_id);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    // the absorbing edge: spent work still lands in Completed
    assert_eq!(job.status(), JobStatus::Completed);
    assert_stream_is_quiet(&completed);
}

#[test]
fn session_drop_leads_to_a_second_attempt() {
    let state = SimMachineState::new("H1");
    state.queue_op_failure(SessionFailure::Session(SessionError::retry(
        "channel interrupted",
    )));
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle()
        .schedule_jobs(Box::new(TouchPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    // first session died mid-run, the retry opened a second one
    assert_eq!(counters.opened(), 2);
    assert_eq!(counters.closed(), 2);
    assert_stream_is_quiet(&completed);
}

#[test]
fn session_drop_with_stop_publishes_without_retry() {
    let state = SimMachineState::new("H1");
    state.queue_op_failure(SessionFailure::Session(SessionError::fatal(
        "endpoint rejected us",
    )));
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle()
        .schedule_jobs(Box::new(TouchPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    // status is left as it was when the channel died
    assert_eq!(job.status(), JobStatus::Executing);
    assert!(job.result().is_none());
    assert_eq!(counters.opened(), 1);
    assert_stream_is_quiet(&completed);
}

#[test]
fn plugin_error_is_captured_as_the_single_result_row() {
    let state = SimMachineState::new("H1");
    let backend = SimBackend::new("B1", 2).with_machine(state.clone());
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle().schedule_jobs(
        Box::new(FailingPlugin {
            message: "File size is bigger than the allowed.".to_string(),
        }),
        vec!["H1".to_string()],
    );

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    assert_eq!(job.status(), JobStatus::Error);
    let rows = job.result().expect("error row");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0]["error_message"],
        "File size is bigger than the allowed."
    );
    assert_eq!(counters.opened(), 1);
    assert_eq!(counters.closed(), 1);
    assert_stream_is_quiet(&completed);
}

#[test]
fn search_with_zero_backends_creates_no_jobs() {
    let (leet, completed) = start(Vec::new(), test_config());

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    assert!(completed.recv_timeout(GRACE).is_err());
    assert!(leet.handle().job_status().is_empty());
}

#[test]
fn unresolvable_hostnames_are_dropped_silently() {
    let backend = SimBackend::new("B1", 2).with_machine(SimMachineState::new("H1"));
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle().schedule_jobs(
        Box::new(MarkerPlugin),
        vec!["H1".to_string(), "GHOST".to_string()],
    );

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.machine().hostname(), "H1");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_stream_is_quiet(&completed);
}

#[test]
fn hostname_matching_ignores_case() {
    let backend = SimBackend::new("B1", 2).with_machine(SimMachineState::new("Desktop-1"));
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["DESKTOP-1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_stream_is_quiet(&completed);
}

#[test]
fn sessions_never_exceed_the_backend_bound() {
    let mut backend = SimBackend::new("B1", 2);
    let mut states = Vec::new();
    for idx in 0..4 {
        let state = SimMachineState::new(&format!("H{idx}"));
        states.push(state.clone());
        backend = backend.with_machine(state);
    }
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());

    leet.handle().schedule_jobs(
        Box::new(SlowPlugin::new(Duration::from_millis(150))),
        (0..4).map(|idx| format!("H{idx}")).collect(),
    );

    for _ in 0..4 {
        let job = completed.recv_timeout(RECV_TIMEOUT).expect("completion");
        assert_eq!(job.status(), JobStatus::Completed);
    }
    assert_stream_is_quiet(&completed);
    assert!(
        counters.max_open() <= 2,
        "observed {} concurrent sessions",
        counters.max_open()
    );
    assert_eq!(counters.opened(), 4);
    assert_eq!(counters.closed(), 4);
}

#[test]
fn expired_jobs_are_published_as_errors() {
    let state = SimMachineState::online_after("H1", 1_000_000);
    let backend = SimBackend::new("B1", 2).with_machine(state);
    let mut config = test_config();
    config.poll_interval = Duration::from_millis(40);
    config.job_expiry = Duration::from_millis(150);
    let (leet, completed) = start(vec![Box::new(backend)], config);

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one publication");
    assert_eq!(job.status(), JobStatus::Error);
    let rows = job.result().expect("error row");
    assert_eq!(rows[0]["error_message"], defaults::JOB_EXPIRED_MESSAGE);
    assert_stream_is_quiet(&completed);
}

#[test]
fn online_machines_run_even_past_the_eligibility_window() {
    let state = SimMachineState::new("H1");
    let backend = SimBackend::new("B1", 2).with_machine(state);
    let mut config = test_config();
    // every job is past its window immediately; only offline machines may
    // be failed for it
    config.job_expiry = Duration::ZERO;
    let (leet, completed) = start(vec![Box::new(backend)], config);

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_stream_is_quiet(&completed);
}

#[test]
fn slow_backends_do_not_block_the_search() {
    let fast = SimBackend::new("B1", 2).with_machine(SimMachineState::new("H1"));
    let slow = SimBackend::new("B2", 2).with_search_delay(Duration::from_secs(2));
    let mut config = test_config();
    config.search_timeout = Duration::from_millis(200);
    let (leet, completed) = start(vec![Box::new(fast), Box::new(slow)], config);

    leet.handle()
        .schedule_jobs(Box::new(MarkerPlugin), vec!["H1".to_string()]);

    let job = completed.recv_timeout(RECV_TIMEOUT).expect("one completion");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.machine().backend_name(), "B1");
    assert_stream_is_quiet(&completed);
}

#[test]
fn cancel_all_jobs_drops_every_pending_job() {
    let mut backend = SimBackend::new("B1", 2);
    for idx in 0..3 {
        backend = backend.with_machine(SimMachineState::online_after(&format!("H{idx}"), 1_000_000));
    }
    let counters = backend.counters();
    let (leet, completed) = start(vec![Box::new(backend)], test_config());
    let handle = leet.handle();

    handle.schedule_jobs(
        Box::new(MarkerPlugin),
        (0..3).map(|idx| format!("H{idx}")).collect(),
    );

    let deadline = Instant::now() + RECV_TIMEOUT;
    while handle.job_status().len() < 3 {
        assert!(Instant::now() < deadline, "jobs never appeared");
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.cancel_all_jobs();

    for _ in 0..3 {
        let job = completed.recv_timeout(RECV_TIMEOUT).expect("publication");
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
    assert_stream_is_quiet(&completed);
    assert_eq!(counters.opened(), 0);
    assert!(handle.job_status().is_empty());
}
