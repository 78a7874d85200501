//! Background task scheduler
//!
//! A dedicated multi-threaded tokio runtime executes message handlers,
//! completion callbacks, session recovery and periodic device reports. Tasks
//! are plain blocking closures; the runtime only provides timing and the
//! worker pool, so callers never need to be async themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{ClientError, Result};

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl TaskHandle {
    /// Stop the task. A run already in progress finishes, no further run starts.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runtime-backed executor for one client session
pub struct TaskScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shut_down: AtomicBool,
}

impl TaskScheduler {
    /// Start a scheduler with `worker_threads` workers (at least one).
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("thingsync-scheduler")
            .enable_time()
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!("failed to start task scheduler: {}", e))
            })?;

        tracing::debug!("Task scheduler started with {} workers", worker_threads.max(1));

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::Configuration(
                "task scheduler has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `task` once after `delay`.
    ///
    /// A panicking task is logged and does not affect other tasks.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_running()?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let task_cancelled = Arc::clone(&cancelled);

        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if task_cancelled.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                if e.is_panic() {
                    tracing::error!("Scheduled task panicked");
                }
            }
        });

        Ok(TaskHandle {
            cancelled,
            abort: join.abort_handle(),
        })
    }

    /// Run `task` every `period`, first after `initial_delay`.
    ///
    /// Runs never overlap. A tick that comes due while the previous run is
    /// still executing is skipped rather than queued.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.ensure_running()?;
        if period.is_zero() {
            return Err(ClientError::Configuration(
                "fixed-rate period must be greater than zero".to_string(),
            ));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let task_cancelled = Arc::clone(&cancelled);
        let task = Arc::new(task);

        let join = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if task_cancelled.load(Ordering::SeqCst) {
                    break;
                }

                let run = Arc::clone(&task);
                if let Err(e) = tokio::task::spawn_blocking(move || run()).await {
                    if e.is_panic() {
                        tracing::warn!("Periodic task panicked, keeping schedule");
                    } else {
                        break;
                    }
                }
            }
        });

        Ok(TaskHandle {
            cancelled,
            abort: join.abort_handle(),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks and tear down the runtime without waiting for
    /// running tasks. Safe to call more than once and from a scheduled task.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("Task scheduler shut down");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
