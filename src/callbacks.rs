//! Native callback plumbing: one-shot callbacks and repeating timers.
//!
//! Both run on a small shared tokio runtime owned by the crate, never on the
//! isolate thread. A callback that needs V8 goes through
//! [`crate::V8Isolate::call_with_lock`].

use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;

/// A one-shot callback handed to the host's scheduler.
pub type NativeCallback = Box<dyn FnOnce() + Send + 'static>;

static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn runtime() -> Option<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("v8-host-bridge-timer")
                .enable_time()
                .build()
            {
                Ok(rt) => Some(rt),
                Err(e) => {
                    tracing::error!("Failed to start native callback runtime: {}", e);
                    None
                }
            }
        })
        .as_ref()
}

/// Run `callback` once on the shared runtime (or a fresh thread if it is unavailable).
pub fn spawn_native(callback: NativeCallback) {
    match runtime() {
        Some(rt) => {
            rt.spawn_blocking(callback);
        }
        None => {
            std::thread::spawn(callback);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Schedule {
    /// `None` disables the timer until the next `change`.
    due: Option<Duration>,
    /// `None` or zero makes the timer one-shot.
    period: Option<Duration>,
}

/// A repeating timer whose schedule can be changed after creation.
///
/// Dropping the timer cancels it; a callback already running completes.
pub struct NativeCallbackTimer {
    schedule: watch::Sender<Schedule>,
    task: JoinHandle<()>,
}

impl NativeCallbackTimer {
    pub fn new<F>(due: Option<Duration>, period: Option<Duration>, callback: F) -> Result<Self, Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let rt = runtime().ok_or_else(|| Error::Config("native callback runtime unavailable".into()))?;
        let (tx, rx) = watch::channel(Schedule { due, period });
        let task = rt.spawn(run_timer(rx, callback));

        Ok(Self { schedule: tx, task })
    }

    /// Reschedule. Returns `false` if the timer task has already stopped.
    pub fn change(&self, due: Option<Duration>, period: Option<Duration>) -> bool {
        self.schedule.send(Schedule { due, period }).is_ok()
    }
}

impl Drop for NativeCallbackTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_timer<F: Fn() + Send + Sync + 'static>(mut rx: watch::Receiver<Schedule>, callback: F) {
    'reschedule: loop {
        let schedule = *rx.borrow_and_update();

        let Some(due) = schedule.due else {
            if rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut wait = due;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => callback(),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue 'reschedule;
                }
            }

            match schedule.period {
                Some(period) if !period.is_zero() => wait = period,
                _ => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    continue 'reschedule;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_callback_runs() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_native(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn periodic_timer_fires_until_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let timer = NativeCallbackTimer::new(
            Some(Duration::from_millis(1)),
            Some(Duration::from_millis(5)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        drop(timer);
        let after_drop = hits.load(Ordering::SeqCst);
        assert!(after_drop >= 2, "timer fired {after_drop} times");

        std::thread::sleep(Duration::from_millis(50));
        assert!(hits.load(Ordering::SeqCst) <= after_drop + 1);
    }

    #[test]
    fn disabled_timer_waits_for_change() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let timer = NativeCallbackTimer::new(None, None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(timer.change(Some(Duration::from_millis(1)), None));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
