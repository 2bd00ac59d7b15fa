//! Scheduler hook: register or cancel periodic invocation of the
//! dispatcher. The Job singleton row is the durable record of "is a
//! periodic run currently registered, and under what id"; the `tokio`
//! task actually driving it lives only in this process, so a restart
//! always re-registers from whatever `schedule_process` the worker
//! binary calls at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatcher::{self, DispatcherError};
use crate::party_directory::PartyDirectory;
use crate::smtp::SmtpClient;
use crate::store::{JobLock, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the single in-flight periodic dispatcher task, if any. At most one
/// task is ever registered at a time: `schedule_process` always de-registers
/// the previous one before registering a new one.
#[derive(Clone)]
pub struct Scheduler {
    current: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Register (or replace) the periodic dispatcher run:
    /// - an existing registration is cancelled first;
    /// - `interval_minutes = None` cancels and leaves nothing registered;
    /// - otherwise a new task is spawned ticking `process_queue` every
    ///   `interval_minutes`, and its id is persisted to the Job singleton.
    #[tracing::instrument(name = "Schedule the periodic dispatcher run", skip_all)]
    pub async fn schedule_process(
        &self,
        store: Arc<Store>,
        directory: Arc<dyn PartyDirectory>,
        smtp: Arc<SmtpClient>,
        host: String,
        port: u16,
        interval_minutes: Option<u64>,
    ) -> Result<(), SchedulerError> {
        if let Some(handle) = self.current.lock().await.take() {
            handle.abort();
        }

        let Some(interval_minutes) = interval_minutes else {
            store.set_job_id(None).await?;
            return Ok(());
        };

        let job_id = Uuid::new_v4().to_string();
        let handle = tokio::spawn(run_periodic(
            store.clone(),
            directory,
            smtp,
            host,
            port,
            Duration::from_secs(interval_minutes * 60),
        ));

        *self.current.lock().await = Some(handle);
        store.set_job_id(Some(&job_id)).await?;

        Ok(())
    }

    /// Hand ownership of the currently-registered task's handle to the
    /// caller, if one is registered. Intended for the worker binary, which
    /// schedules once at startup and then awaits the handle directly
    /// alongside its other long-running tasks.
    pub async fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.current.lock().await.take()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Tick `process_queue` on a fixed interval until the task is aborted.
/// Every tick runs independently: a failed or slow run never blocks the
/// next tick's schedule (the interval, not the run, paces invocation).
async fn run_periodic(
    store: Arc<Store>,
    directory: Arc<dyn PartyDirectory>,
    smtp: Arc<SmtpClient>,
    host: String,
    port: u16,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(lock) = try_acquire_run(&store).await else {
            continue;
        };

        let outcome = dispatcher::process_queue(&store, directory.as_ref(), &smtp, &host, port).await;
        release_run(lock).await;

        if let Err(e) = outcome {
            log_dispatch_failure(&e);
        }
    }
}

/// Skip this tick entirely if another run already holds the advisory
/// lock — non-blocking, so a run that can't acquire it skips its tick.
/// The returned guard pins the connection that took the lock; it must be
/// handed back to `release_run` unchanged so the unlock runs on the same
/// connection.
async fn try_acquire_run(store: &Store) -> Option<JobLock> {
    match store.try_acquire_job_lock().await {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "Failed to acquire the dispatcher advisory lock; skipping this tick"
            );
            None
        }
    }
}

async fn release_run(lock: JobLock) {
    if let Err(e) = lock.release().await {
        tracing::error!(
            error.cause_chain = ?e,
            error.message = %e,
            "Failed to release the dispatcher advisory lock"
        );
    }
}

fn log_dispatch_failure(e: &DispatcherError) {
    tracing::error!(
        error.cause_chain = ?e,
        error.message = %e,
        "Dispatcher run failed"
    );
}
