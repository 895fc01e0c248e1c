//! Min-heap timer service.
//!
//! One timer thread keyed by deadline plus a small set of shared callback
//! workers. Serves the search-expiry one-shots and the per-job online
//! probes; callbacks run to completion on a worker and communicate onward
//! only by posting control messages.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
    shutdown: bool,
}

pub struct TimerService {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    timer_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl TimerService {
    pub fn start(worker_count: usize) -> anyhow::Result<Self> {
        let (work_tx, work_rx) = mpsc::channel::<Callback>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::new();
        for idx in 0..worker_count.max(1) {
            let work_rx = Arc::clone(&work_rx);
            workers.push(
                thread::Builder::new()
                    .name(format!("sched-worker-{idx}"))
                    .spawn(move || worker_loop(work_rx))?,
            );
        }

        let state = Arc::new((
            Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let timer_state = Arc::clone(&state);
        let timer_thread = thread::Builder::new()
            .name("sched-timer".to_string())
            .spawn(move || timer_loop(timer_state, work_tx))?;

        Ok(Self {
            state,
            timer_thread: Some(timer_thread),
            workers,
        })
    }

    /// Run `callback` on a scheduler worker once `delay` has passed.
    /// Scheduling against a stopped service is a no-op.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let (lock, cv) = &*self.state;
        let mut state = lock.lock().expect("timer state lock poisoned");
        if state.shutdown {
            debug!("timer service is stopped; dropping a callback");
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            callback: Box::new(callback),
        });
        cv.notify_one();
    }

    /// Stop the timer thread and the workers. Armed callbacks that have not
    /// fired yet are dropped.
    pub fn shutdown(&mut self) {
        {
            let (lock, cv) = &*self.state;
            lock.lock().expect("timer state lock poisoned").shutdown = true;
            cv.notify_all();
        }
        if let Some(handle) = self.timer_thread.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(state: Arc<(Mutex<TimerState>, Condvar)>, work_tx: Sender<Callback>) {
    let (lock, cv) = &*state;
    let mut guard = lock.lock().expect("timer state lock poisoned");
    loop {
        if guard.shutdown {
            break;
        }

        let now = Instant::now();
        while guard
            .heap
            .peek()
            .is_some_and(|entry| entry.deadline <= now)
        {
            let entry = guard.heap.pop().expect("peeked entry vanished");
            if work_tx.send(entry.callback).is_err() {
                return;
            }
        }

        guard = match guard.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                cv.wait_timeout(guard, wait)
                    .expect("timer state lock poisoned")
                    .0
            }
            None => cv.wait(guard).expect("timer state lock poisoned"),
        };
    }
    // dropping work_tx stops the workers
}

fn worker_loop(rx: Arc<Mutex<Receiver<Callback>>>) {
    loop {
        let callback = {
            let guard = rx.lock().expect("scheduler work queue lock poisoned");
            guard.recv()
        };
        match callback {
            Ok(callback) => callback(),
            Err(_) => break,
        }
    }
}
