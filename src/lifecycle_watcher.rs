//! Detection of client process exit.
//!
//! A watch reports its pid exactly once, on an mpsc channel, when the
//! process is gone, has become a zombie, or the pid now belongs to a
//! process with a different start token. Start tokens do not follow the
//! wall clock, so stepping the time leaves live clients alone. The daemon's reaper loop turns
//! each report into a complete close of the client's session.

use crate::daemon_log::{daemon_log, service_warning};
use crate::process_table::ProcessTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub trait ClientWatcher: Send + Sync {
    /// Starts watching `pid`; returns a handle for [`ClientWatcher::cancel`].
    fn watch(&self, pid: u32) -> u64;

    fn cancel(&self, watch_id: u64);
}

/// Polls the process table once per interval for every watched pid.
pub struct PollingWatcher {
    exited_tx: mpsc::UnboundedSender<u32>,
    process_table: Arc<dyn ProcessTable>,
    interval: Duration,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl PollingWatcher {
    /// Returns the watcher and the receiving end of its exit reports.
    pub fn new(
        process_table: Arc<dyn ProcessTable>,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            exited_tx,
            process_table,
            interval,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        (watcher, exited_rx)
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ClientWatcher for PollingWatcher {
    fn watch(&self, pid: u32) -> u64 {
        let watch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            service_warning(&format!("No runtime available to watch client {}", pid));
            return watch_id;
        };

        let table = Arc::clone(&self.process_table);
        let exited_tx = self.exited_tx.clone();
        let period = self.interval;
        let started = table.start_token(pid);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = table.start_token(pid);
                if current.is_none() || current != started {
                    daemon_log("watcher", &format!("Client {} exited", pid));
                    let _ = exited_tx.send(pid);
                    return;
                }
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(watch_id, task);
        watch_id
    }

    fn cancel(&self, watch_id: u64) {
        if let Some(task) = self.tasks().remove(&watch_id) {
            task.abort();
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_watcher_tests.rs"]
mod lifecycle_watcher_tests;
