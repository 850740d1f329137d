// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The background sender thread: one per process, woken every 200ms, that
//! fires each registered (target, sender) pair no more often than its
//! configured interval.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::collector::CollectionTarget;
use crate::constants::{DEFAULT_SEND_INTERVAL_SECS, WORKER_TICK};
use crate::errors::SendError;

/// Anything the worker can periodically drive: in production this is
/// `crate::sender::Sender`, but tests substitute small stand-ins to exercise
/// the scheduling and fatal-error-handling logic without real sockets.
pub trait MetricsSender: Send + Sync {
    fn send(
        &self,
        target: &CollectionTarget,
        now: i64,
        interval: i64,
        process_token: &str,
    ) -> Result<(), SendError>;
}

struct Entry {
    target: Arc<CollectionTarget>,
    sender: Arc<dyn MetricsSender>,
    interval: Duration,
    last_called: Instant,
}

/// Result of one worker tick, reported back to the caller for logging and
/// (in the fatal case) for terminating the loop.
pub enum TickOutcome {
    Continued,
    Fatal(SendError),
}

/// The schedule of (target, sender) pairs the worker drives, plus the pure
/// tick logic. Separated from the thread/sleep loop so it's directly
/// unit-testable.
#[derive(Default)]
pub struct Worker {
    entries: Mutex<Vec<Entry>>,
}

impl Worker {
    pub fn new() -> Self {
        Worker::default()
    }

    pub fn add_target(
        &self,
        target: Arc<CollectionTarget>,
        sender: Arc<dyn MetricsSender>,
        interval_secs: i64,
    ) {
        let mut entries = self.entries.lock().expect("worker lock poisoned");
        entries.push(Entry {
            target,
            sender,
            interval: Duration::from_secs(interval_secs.max(0) as u64),
            last_called: Instant::now() - Duration::from_secs(interval_secs.max(0) as u64 + 1),
        });
        drop(entries);
        check_threads_started();
    }

    /// Fire every entry whose interval has elapsed since it was last called.
    /// Recoverable send errors are logged and the tick continues; a fatal
    /// error is logged and returned so the caller can stop the loop.
    pub fn tick(&self, now_wall: i64, process_token: &str) -> TickOutcome {
        let mut entries = self.entries.lock().expect("worker lock poisoned");
        let now = Instant::now();
        for entry in entries.iter_mut() {
            if now.duration_since(entry.last_called) <= entry.interval {
                continue;
            }
            entry.last_called = now;
            let interval_secs = entry.interval.as_secs() as i64;
            match entry
                .sender
                .send(&entry.target, now_wall, interval_secs, process_token)
            {
                Ok(()) => {}
                Err(SendError::Recoverable(source)) => {
                    tracing::warn!(error = %source, "error sending stats");
                }
                Err(fatal @ SendError::Fatal(_)) => {
                    tracing::error!(error = %fatal, "worker thread exiting");
                    return TickOutcome::Fatal(fatal);
                }
            }
        }
        TickOutcome::Continued
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("worker lock poisoned").len()
    }
}

fn process_token() -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("{}:{}", std::process::id(), &short[..6])
}

static WORKER: OnceLock<Arc<Worker>> = OnceLock::new();
static STARTED_PID: AtomicU32 = AtomicU32::new(0);
static THREAD_SPAWNED: Mutex<()> = Mutex::new(());

pub fn global_worker() -> &'static Arc<Worker> {
    WORKER.get_or_init(|| Arc::new(Worker::new()))
}

/// Starts the background sender thread the first time it's called in a
/// given process, and restarts it after a fork (detected by comparing the
/// current pid against the pid the thread was started under) since threads
/// don't survive `fork()`.
pub fn check_threads_started() {
    let pid = std::process::id();
    if STARTED_PID.load(Ordering::SeqCst) == pid {
        return;
    }
    let _guard = THREAD_SPAWNED.lock().expect("spawn lock poisoned");
    if STARTED_PID.load(Ordering::SeqCst) == pid {
        return;
    }
    STARTED_PID.store(pid, Ordering::SeqCst);
    let worker = global_worker().clone();
    std::thread::spawn(move || run(worker));
}

fn run(worker: Arc<Worker>) {
    let token = process_token();
    tracing::info!(pid = std::process::id(), process_token = %token, "starting message sender thread");
    loop {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64;
        match worker.tick(now, &token) {
            TickOutcome::Continued => {}
            TickOutcome::Fatal(_) => break,
        }
        std::thread::sleep(WORKER_TICK);
    }
}

pub const DEFAULT_INTERVAL_SECS: i64 = DEFAULT_SEND_INTERVAL_SECS;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectionTarget;
    use std::sync::atomic::AtomicUsize;

    struct CountingSender {
        calls: AtomicUsize,
        fail_after: Option<usize>,
        fatal_after: Option<usize>,
    }

    impl MetricsSender for CountingSender {
        fn send(
            &self,
            _target: &CollectionTarget,
            _now: i64,
            _interval: i64,
            _process_token: &str,
        ) -> Result<(), SendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal_after == Some(n) {
                return Err(SendError::Fatal("boom".into()));
            }
            if self.fail_after == Some(n) {
                return Err(SendError::Recoverable("transient".into()));
            }
            Ok(())
        }
    }

    fn target() -> Arc<crate::collector::CollectionTarget> {
        crate::collector::global_targets().target_for_name("test-worker-target")
    }

    #[test]
    fn tick_skips_entries_before_their_interval_elapses() {
        let worker = Worker::new();
        let sender = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
            fail_after: None,
            fatal_after: None,
        });
        worker.add_target(target(), sender.clone(), 3600);
        // First tick fires immediately because `add_target` backdates
        // `last_called`.
        worker.tick(0, "1:abcdef");
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        worker.tick(0, "1:abcdef");
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1, "interval has not elapsed yet");
    }

    #[test]
    fn a_recoverable_error_does_not_stop_the_schedule() {
        let worker = Worker::new();
        let sender = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
            fail_after: Some(1),
            fatal_after: None,
        });
        worker.add_target(target(), sender, 0);
        match worker.tick(0, "1:abcdef") {
            TickOutcome::Continued => {}
            TickOutcome::Fatal(_) => panic!("recoverable error must not be fatal"),
        }
    }

    #[test]
    fn one_senders_fatal_error_stops_the_whole_tick_schedule() {
        // Mirrors two independently-scheduled senders sharing one worker: a
        // fatal error from the second sender on its third invocation must
        // not be masked by, nor mask, the first sender's own recoverable
        // error on its second invocation.
        let worker = Worker::new();
        let sender_one = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
            fail_after: Some(2),
            fatal_after: None,
        });
        let sender_two = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
            fail_after: None,
            fatal_after: Some(3),
        });
        worker.add_target(target(), sender_one.clone(), 0);
        worker.add_target(target(), sender_two.clone(), 0);

        assert!(matches!(worker.tick(0, "1:abcdef"), TickOutcome::Continued));
        assert!(matches!(worker.tick(0, "1:abcdef"), TickOutcome::Continued));
        assert!(matches!(worker.tick(0, "1:abcdef"), TickOutcome::Fatal(_)));

        assert_eq!(sender_one.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sender_two.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_fatal_error_is_reported_to_the_caller() {
        let worker = Worker::new();
        let sender = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
            fail_after: None,
            fatal_after: Some(1),
        });
        worker.add_target(target(), sender, 0);
        match worker.tick(0, "1:abcdef") {
            TickOutcome::Fatal(_) => {}
            TickOutcome::Continued => panic!("fatal error must propagate"),
        }
    }
}
