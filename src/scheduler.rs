//! Background task scheduling
//!
//! `Scheduler` runs named periodic tasks on the tokio runtime and shuts
//! them down cleanly: `shutdown` signals every loop, then waits for all
//! of them to finish their current tick before returning.

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodic task runner with coordinated shutdown
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Spawn a named task that runs once per interval until shutdown
    ///
    /// The first tick fires after one full interval, not immediately.
    /// Task errors are logged and do not stop the loop.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, interval: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send,
    {
        let name = name.to_string();
        let mut shutdown = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately on the first call; swallow that tick
            ticker.tick().await;

            tracing::debug!(task = %name, interval_ms = interval.as_millis() as u64, "Task scheduled");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            tracing::error!(task = %name, error = %e, "Scheduled task failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!(task = %name, "Task stopping");
                            break;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Signal all tasks to stop and wait for them to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut self.handles);
        join_all(handles).await;
        tracing::info!("Scheduler stopped");
    }

    /// Number of registered tasks
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
