//! The worker pool: a fixed-size set of worker tasks, each looping
//! {wait-for-wakeup, claim-one, execute, complete}, plus the optional
//! polling ticker for deployments where notifications are unreliable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::JobContext;
use crate::errors::{JobQueueError, Result};
use crate::job::Job;
use crate::listener::JOB_AVAILABLE_CHANNEL;
use crate::registry::Registry;
use crate::sql::claim_job::start_next_job;
use crate::sql::complete_job::{schedule_retry, set_job_error, set_job_result};

pub(crate) struct WorkerPool {
    pg_pool: PgPool,
    escaped_schema: String,
    registry: Arc<Registry>,
    /// Applied to every job execution; zero disables the timeout.
    job_timeout: Duration,
    /// Wakeup channel capacity. A wakeup is a signal that at least one job
    /// may be claimable, not a work item; sends into a full buffer are
    /// dropped because a prior signal is already outstanding.
    wakeup_buffer: usize,
    claim_error_count: AtomicU64,
    state: Mutex<PoolState>,
}

struct PoolState {
    running: Option<RunningPool>,
    /// Dropped and reallocated to stop polling tickers. Every ticker holds
    /// its own receiver, cloned before it started, so rotation cannot race
    /// a running ticker.
    stop_polling: watch::Sender<()>,
}

struct RunningPool {
    wakeup_tx: mpsc::Sender<()>,
    listen_task: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(
        pg_pool: PgPool,
        escaped_schema: String,
        registry: Arc<Registry>,
        job_timeout: Duration,
        wakeup_buffer: usize,
    ) -> WorkerPool {
        WorkerPool {
            pg_pool,
            escaped_schema,
            registry,
            job_timeout,
            wakeup_buffer,
            claim_error_count: AtomicU64::new(0),
            state: Mutex::new(PoolState {
                running: None,
                stop_polling: watch::channel(()).0,
            }),
        }
    }

    /// Starts `num_workers` worker tasks and the `job_available` listener.
    ///
    /// `cancel` is the parent cancellation scope: cancelling it makes the
    /// workers unwind after persisting the outcome of their in-flight job.
    pub(crate) fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
        num_workers: usize,
    ) -> Result<()> {
        if num_workers == 0 {
            return Err(JobQueueError::NoWorkerThreads);
        }

        let mut state = self.state.lock().expect("pool state poisoned");
        if state.running.is_some() {
            return Err(JobQueueError::WorkersAlreadyRunning);
        }

        let (wakeup_tx, wakeup_rx) = mpsc::channel(self.wakeup_buffer);
        let wakeup_rx = Arc::new(AsyncMutex::new(wakeup_rx));

        let listen_task = tokio::spawn(job_available_listener(
            Arc::clone(&self),
            cancel.clone(),
        ));

        let mut worker_handles = Vec::with_capacity(num_workers);
        for worker_index in 0..num_workers {
            worker_handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self),
                cancel.clone(),
                Arc::clone(&wakeup_rx),
                worker_index,
            )));
        }

        state.running = Some(RunningPool {
            wakeup_tx,
            listen_task,
            worker_handles,
        });

        info!(num_workers, "Started worker threads");
        Ok(())
    }

    /// Non-blocking wakeup: notifies one waiting worker that a job may be
    /// claimable. No-op while the pool is not running.
    pub(crate) fn signal_job_available(&self) {
        let state = self.state.lock().expect("pool state poisoned");
        if let Some(running) = &state.running {
            let _ = running.wakeup_tx.try_send(());
        }
    }

    /// Spawns a ticker emitting the wakeup signal every `interval`.
    ///
    /// Used where server-to-client notifications are unreliable; may be
    /// called before or after `start`.
    pub(crate) fn start_polling(self: Arc<Self>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(JobQueueError::InvalidPollInterval);
        }

        // Capture the stop channel before spawning so a later rotation
        // cannot race this ticker.
        let mut stop = {
            self.state
                .lock()
                .expect("pool state poisoned")
                .stop_polling
                .subscribe()
        };
        let pool = Arc::clone(&self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick of a tokio interval completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.signal_job_available(),
                    changed = stop.changed() => {
                        if changed.is_err() {
                            debug!("Polling stopped");
                            return;
                        }
                    }
                }
            }
        });

        debug!(?interval, "Started polling for available jobs");
        Ok(())
    }

    /// Stops all polling tickers by rotating the stop channel.
    pub(crate) fn stop_polling(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.stop_polling = watch::channel(()).0;
    }

    /// Stops accepting work and waits until every worker has completed its
    /// in-flight job. Idempotent.
    pub(crate) async fn finish(&self) {
        let Some(mut running) = self.shutdown() else {
            return;
        };
        let worker_handles = std::mem::take(&mut running.worker_handles);
        // Dropping the sender closes the wakeup channel: the sentinel the
        // workers exit on.
        drop(running);

        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {e}");
            }
        }
        info!("Worker threads have finished");
    }

    /// Like `finish` but does not wait for in-flight jobs. Idempotent.
    pub(crate) fn stop(&self) {
        if self.shutdown().is_some() {
            info!("Worker threads stopping without waiting");
        }
    }

    fn shutdown(&self) -> Option<RunningPool> {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.stop_polling = watch::channel(()).0;
        let running = state.running.take()?;
        drop(state);

        // Dropping the listener's connection unlistens job_available.
        running.listen_task.abort();
        Some(running)
    }

    async fn claim_next(&self) -> Option<Job> {
        let allowed_types = self.registry.registered_types();
        match start_next_job(
            &self.pg_pool,
            &self.escaped_schema,
            Utc::now(),
            &allowed_types,
        )
        .await
        {
            Ok(job) => job,
            Err(e) => {
                let claim_errors = self.claim_error_count.fetch_add(1, Ordering::Relaxed) + 1;
                error!(claim_errors, "Error while claiming the next job: {e}");
                // transient errors are retried on the next wakeup or tick
                None
            }
        }
    }

    async fn execute_and_complete(&self, cancel: &CancellationToken, job: Job) {
        let job = Arc::new(job);
        let job_id = *job.id();

        let Some(worker_fn) = self.registry.get_worker(job.job_type()) else {
            // the registered set can shrink between claim and execution
            let msg = format!("no worker for job of type '{}'", job.job_type());
            error!(%job_id, "{msg}");
            if let Err(e) = set_job_error(
                &self.pg_pool,
                &self.escaped_schema,
                job_id,
                &msg,
                None,
                true,
            )
            .await
            {
                error!(%job_id, "Error while updating job error in the database: {e}");
            }
            return;
        };

        let job_cancel = cancel.child_token();
        let ctx = JobContext::new(
            self.pg_pool.clone(),
            self.escaped_schema.clone(),
            job.clone(),
            job_cancel.clone(),
        );

        debug!(%job_id, job_type = job.job_type(), "Executing job");

        // Spawned so a panicking worker only fails its own task.
        let task = tokio::spawn(worker_fn(ctx.clone()));
        let abort_handle = task.abort_handle();

        let outcome = if self.job_timeout > Duration::ZERO {
            match tokio::time::timeout(self.job_timeout, task).await {
                Err(_) => {
                    job_cancel.cancel();
                    abort_handle.abort();
                    Err(RunJobError::Timeout(self.job_timeout))
                }
                Ok(join_result) => flatten_outcome(join_result),
            }
        } else {
            flatten_outcome(task.await)
        };

        match outcome {
            Ok(result) => {
                if let Err(e) =
                    set_job_result(&self.pg_pool, &self.escaped_schema, job_id, result).await
                {
                    error!(%job_id, "Error while updating job result in the database: {e}");
                } else {
                    debug!(%job_id, job_type = job.job_type(), "Job finished");
                }
            }
            Err(run_error) => self.complete_with_error(ctx, &job, run_error).await,
        }
    }

    /// The error completion path: persist the error, then consult the
    /// retry policy. Finality is resolved *before* persisting so the
    /// bundle counter moves exactly once per job, on its final stop.
    async fn complete_with_error(&self, ctx: JobContext, job: &Arc<Job>, run_error: RunJobError) {
        let job_id = *job.id();
        let error_msg = run_error.to_string();
        let headline = error_msg.lines().next().unwrap_or_default().trim();

        let has_budget = job.current_retry_count() < job.max_retry_count();
        let scheduler = self.registry.get_retry_scheduler(job.job_type());
        let final_stop = !has_budget || scheduler.is_none();

        if final_stop {
            error!(%job_id, job_type = job.job_type(), "Job error: {headline}");
        } else {
            warn!(%job_id, job_type = job.job_type(), "Job error: {headline}");
        }

        if let Err(e) = set_job_error(
            &self.pg_pool,
            &self.escaped_schema,
            job_id,
            &error_msg,
            None,
            final_stop,
        )
        .await
        {
            error!(%job_id, "Error while updating job error in the database: {e}");
            return;
        }

        if !has_budget {
            return;
        }

        let Some(scheduler) = scheduler else {
            // operator action required: the job had budget left but
            // nothing to schedule it with, so it stays finally failed
            error!(
                %job_id,
                "{}",
                JobQueueError::NoRetryScheduler(job.job_type().clone())
            );
            return;
        };

        let next_start = match scheduler(ctx).await {
            Ok(next_start) => next_start,
            Err(e) => {
                // the errored row still has budget; startup recovery
                // reclaims it
                error!(%job_id, "Retry scheduler returned an error: {e}");
                return;
            }
        };

        if let Err(e) = schedule_retry(
            &self.pg_pool,
            &self.escaped_schema,
            job_id,
            next_start,
            job.current_retry_count() + 1,
        )
        .await
        {
            error!(%job_id, "Could not schedule retry for job: {e}");
        } else {
            debug!(
                %job_id,
                %next_start,
                retry = job.current_retry_count() + 1,
                "Scheduled job retry"
            );
        }
    }
}

/// Errors from executing a single job's worker function.
#[derive(Error, Debug)]
enum RunJobError {
    /// The worker function panicked
    #[error("job worker panic: {0}")]
    Panic(JoinError),
    /// The worker function returned an error
    #[error("{0}")]
    Failed(String),
    /// The worker function exceeded the configured job timeout
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

fn flatten_outcome(
    join_result: core::result::Result<core::result::Result<Option<Value>, String>, JoinError>,
) -> core::result::Result<Option<Value>, RunJobError> {
    match join_result {
        Err(join_error) => Err(RunJobError::Panic(join_error)),
        Ok(Err(message)) => Err(RunJobError::Failed(message)),
        Ok(Ok(value)) => Ok(value),
    }
}

/// One worker task: claim, execute, complete; park on the wakeup channel
/// while nothing is claimable. Exits when the wakeup channel closes or
/// the parent scope is cancelled.
async fn worker_loop(
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    wakeup_rx: Arc<AsyncMutex<mpsc::Receiver<()>>>,
    worker_index: usize,
) {
    debug!(worker_index, "Starting worker thread");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let job = tokio::select! {
            job = pool.claim_next() => job,
            // an aborted claim rolls its transaction back; the row stays
            // pending
            _ = cancel.cancelled() => None,
        };

        let Some(job) = job else {
            let wakeup = tokio::select! {
                wakeup = async { wakeup_rx.lock().await.recv().await } => wakeup,
                _ = cancel.cancelled() => None,
            };
            if wakeup.is_none() {
                // channel closed or parent cancelled: no more work
                break;
            }
            continue;
        };

        pool.execute_and_complete(&cancel, job).await;
    }

    debug!(worker_index, "Worker thread ended");
}

/// Translates `job_available` pings into wakeup-channel signals.
async fn job_available_listener(pool: Arc<WorkerPool>, cancel: CancellationToken) {
    let mut listener = match PgListener::connect_with(&pool.pg_pool).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not connect job_available listener: {e}");
            return;
        }
    };
    if let Err(e) = listener.listen(JOB_AVAILABLE_CHANNEL).await {
        error!("Could not listen on job_available: {e}");
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = listener.recv() => match received {
                Ok(_) => pool.signal_job_available(),
                Err(e) => {
                    // workers fall back to the polling ticker, if any
                    error!("job_available listener failed: {e}");
                    return;
                }
            }
        }
    }
}
