use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bundle::JobBundle;
use crate::context::JobContext;
use crate::errors::{JobQueueError, Result};
use crate::job::Job;
use crate::listener::{
    run_notification_router, BundleStoppedCallback, JobStoppedCallback, ListenerId,
    StoppedListeners,
};
use crate::migrate::migrate;
use crate::recovery::{reset_dangling_started_jobs, reset_interrupted_retryable_jobs};
use crate::registry::Registry;
use crate::sql;
use crate::sql::queue_details::QueueStatus;
use crate::utils::escape_identifier;
use crate::worker::WorkerPool;

/// Explicit submission options, replacing ambient context values.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddJobOptions {
    /// Execute the worker inline instead of persisting the job. Useful in
    /// tests and request-scoped flows that need the result immediately.
    pub synchronous: bool,
    /// Discard the submission with a log line.
    pub ignore: bool,
}

/// Configuration for [`QueueOptions::init`].
#[derive(Default)]
pub struct QueueOptions {
    pg_pool: Option<PgPool>,
    database_url: Option<String>,
    max_pg_conn: Option<u32>,
    schema: Option<String>,
    job_timeout: Option<Duration>,
    wakeup_buffer: Option<usize>,
    reset_dangling_jobs: bool,
}

impl QueueOptions {
    /// Connects, prepares the schema, runs crash recovery and returns the
    /// queue handle.
    pub async fn init(self) -> Result<JobQueue> {
        let pg_pool = match self.pg_pool {
            Some(pg_pool) => pg_pool,
            None => {
                let db_url = self
                    .database_url
                    .ok_or(JobQueueError::MissingDatabaseUrl)?;

                PgPoolOptions::new()
                    .max_connections(self.max_pg_conn.unwrap_or(20))
                    .connect(&db_url)
                    .await?
            }
        };

        let schema = self.schema.unwrap_or_else(|| String::from("jobqueue"));
        let escaped_schema = escape_identifier(&pg_pool, &schema).await?;

        migrate(&pg_pool, &escaped_schema).await?;

        // Jobs that errored with budget left look finally failed after a
        // crash between the retry scheduler and its persisted reschedule.
        // Resetting them is safe in any deployment.
        let num_reset = reset_interrupted_retryable_jobs(&pg_pool, &escaped_schema).await?;
        if num_reset > 0 {
            info!(num_reset, "Reset interrupted retryable jobs on startup");
        }

        if self.reset_dangling_jobs {
            let num_reset = reset_dangling_started_jobs(&pg_pool, &escaped_schema).await?;
            if num_reset > 0 {
                info!(num_reset, "Reset dangling started jobs on startup");
            }
        }

        let registry = Arc::new(Registry::default());
        let job_timeout = self
            .job_timeout
            .unwrap_or(Duration::from_secs(15 * 60));
        let wakeup_buffer = self.wakeup_buffer.unwrap_or(1024).max(1);

        let worker_pool = Arc::new(WorkerPool::new(
            pg_pool.clone(),
            escaped_schema.clone(),
            Arc::clone(&registry),
            job_timeout,
            wakeup_buffer,
        ));

        Ok(JobQueue {
            inner: Arc::new(QueueInner {
                pg_pool,
                escaped_schema,
                registry,
                listeners: Arc::new(StoppedListeners::default()),
                worker_pool,
                router_task: Mutex::new(None),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    pub fn max_pg_conn(mut self, value: u32) -> Self {
        self.max_pg_conn = Some(value);
        self
    }

    pub fn schema(mut self, value: &str) -> Self {
        self.schema = Some(value.into());
        self
    }

    /// Timeout applied to every job execution. Zero disables it; the
    /// default is 15 minutes.
    pub fn job_timeout(mut self, value: Duration) -> Self {
        self.job_timeout = Some(value);
        self
    }

    /// Capacity of the buffered wakeup channel. Never zero.
    pub fn wakeup_buffer(mut self, value: usize) -> Self {
        self.wakeup_buffer = Some(value);
        self
    }

    /// Additionally reset jobs that were mid-execution when a prior
    /// process died (`started_at` set, `stopped_at` null).
    ///
    /// Only safe when a single queue instance uses the database; another
    /// live instance may still be executing those rows. Multi-instance
    /// setups should inspect [`JobQueue::jobs_started_before`] instead.
    pub fn reset_dangling_jobs(mut self, value: bool) -> Self {
        self.reset_dangling_jobs = value;
        self
    }
}

struct QueueInner {
    pg_pool: PgPool,
    escaped_schema: String,
    registry: Arc<Registry>,
    listeners: Arc<StoppedListeners>,
    worker_pool: Arc<WorkerPool>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

/// The durable job queue: producer API, worker pool lifecycle, listener
/// registration and administration in one cloneable handle.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Starting point for configuring and initializing a queue.
    pub fn options() -> QueueOptions {
        QueueOptions::default()
    }

    pub fn pg_pool(&self) -> &PgPool {
        &self.inner.pg_pool
    }

    pub fn escaped_schema(&self) -> &str {
        &self.inner.escaped_schema
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(JobQueueError::Closed);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////
    // Producer API

    /// Persists a fully-materialized job.
    pub async fn add_job(&self, job: Job) -> Result<()> {
        self.add_job_with_options(job, AddJobOptions::default())
            .await
    }

    pub async fn add_job_with_options(&self, job: Job, options: AddJobOptions) -> Result<()> {
        self.ensure_open()?;
        job.validate()?;

        if options.ignore {
            debug!(job_id = %job.id(), "Ignoring job");
            return Ok(());
        }
        if options.synchronous {
            debug!(job_id = %job.id(), "Executing job synchronously");
            return self.run_job_inline(&job).await.map(|_| ());
        }

        sql::insert_job::insert_job(&self.inner.pg_pool, &self.inner.escaped_schema, &job).await
    }

    /// Atomically persists a bundle and all of its member jobs.
    pub async fn add_bundle(&self, bundle: JobBundle) -> Result<()> {
        self.add_bundle_with_options(bundle, AddJobOptions::default())
            .await
    }

    pub async fn add_bundle_with_options(
        &self,
        bundle: JobBundle,
        options: AddJobOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        for job in bundle.jobs() {
            job.validate()?;
        }

        if options.ignore {
            debug!(bundle_id = %bundle.id(), "Ignoring job bundle");
            return Ok(());
        }
        if options.synchronous {
            debug!(bundle_id = %bundle.id(), "Executing job bundle synchronously");
            for job in bundle.jobs() {
                self.run_job_inline(job).await?;
            }
            self.inner.listeners.dispatch_bundle_inline(&bundle);
            return Ok(());
        }

        sql::insert_job::insert_bundle(&self.inner.pg_pool, &self.inner.escaped_schema, &bundle)
            .await
    }

    /// Runs the registered worker inline, without persistence.
    async fn run_job_inline(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        let worker_fn = self
            .inner
            .registry
            .get_worker(job.job_type())
            .ok_or_else(|| JobQueueError::NoWorker(job.job_type().clone()))?;

        let ctx = JobContext::new(
            self.inner.pg_pool.clone(),
            self.inner.escaped_schema.clone(),
            Arc::new(job.clone()),
            CancellationToken::new(),
        );

        match tokio::spawn(worker_fn(ctx)).await {
            Err(join_error) => Err(JobQueueError::WorkerFailed(format!(
                "job worker panic: {join_error}"
            ))),
            Ok(Err(message)) => Err(JobQueueError::WorkerFailed(message)),
            Ok(Ok(result)) => Ok(result),
        }
    }

    ////////////////////////////////////////////////////////////////////
    // Inspection

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.ensure_open()?;
        sql::get_job::get_job(&self.inner.pg_pool, &self.inner.escaped_schema, job_id).await
    }

    /// Fetches a bundle together with all of its member jobs.
    pub async fn get_bundle(&self, bundle_id: Uuid) -> Result<Option<JobBundle>> {
        self.ensure_open()?;
        sql::get_job::get_bundle_with_jobs(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            bundle_id,
        )
        .await
    }

    pub async fn get_status(&self) -> Result<QueueStatus> {
        self.ensure_open()?;
        sql::queue_details::get_status(&self.inner.pg_pool, &self.inner.escaped_schema).await
    }

    pub async fn jobs_to_do(&self) -> Result<Vec<Job>> {
        self.ensure_open()?;
        sql::queue_details::list_jobs_to_do(&self.inner.pg_pool, &self.inner.escaped_schema).await
    }

    pub async fn jobs_with_errors(&self) -> Result<Vec<Job>> {
        self.ensure_open()?;
        sql::queue_details::list_jobs_with_errors(&self.inner.pg_pool, &self.inner.escaped_schema)
            .await
    }

    pub async fn jobs_started_before(&self, before: DateTime<Utc>) -> Result<Vec<Job>> {
        self.ensure_open()?;
        sql::queue_details::list_jobs_started_before(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            before,
        )
        .await
    }

    ////////////////////////////////////////////////////////////////////
    // Administration

    /// Restores a job to pending, adjusting the bundle counter if the job
    /// had already been counted as stopped. Returns the number reset.
    pub async fn reset_job(&self, job_id: Uuid) -> Result<u64> {
        self.ensure_open()?;
        sql::reset_job::reset_job(&self.inner.pg_pool, &self.inner.escaped_schema, job_id).await
    }

    pub async fn reset_jobs(&self, job_ids: &[Uuid]) -> Result<u64> {
        self.ensure_open()?;
        sql::reset_job::reset_jobs(&self.inner.pg_pool, &self.inner.escaped_schema, job_ids).await
    }

    /// Reschedules a job to a new start time, clearing its execution state.
    pub async fn set_job_start(&self, job_id: Uuid, start_at: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        sql::complete_job::set_job_start(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            job_id,
            start_at,
        )
        .await
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_job(&self.inner.pg_pool, &self.inner.escaped_schema, job_id).await
    }

    pub async fn delete_jobs_from_origin(&self, origin: &str) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_jobs_from_origin(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            origin,
        )
        .await
    }

    pub async fn delete_jobs_of_type(&self, job_type: &str) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_jobs_of_type(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            job_type,
        )
        .await
    }

    /// Removes jobs that are stopped, error-free and not part of a bundle.
    pub async fn delete_finished_jobs(&self) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_finished_jobs(&self.inner.pg_pool, &self.inner.escaped_schema)
            .await
    }

    pub async fn delete_bundle(&self, bundle_id: Uuid) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_bundle(&self.inner.pg_pool, &self.inner.escaped_schema, bundle_id)
            .await
    }

    pub async fn delete_bundles_from_origin(&self, origin: &str) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_bundles_from_origin(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            origin,
        )
        .await
    }

    pub async fn delete_bundles_of_type(&self, bundle_type: &str) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_bundles_of_type(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
            bundle_type,
        )
        .await
    }

    pub async fn delete_all_jobs_and_bundles(&self) -> Result<u64> {
        self.ensure_open()?;
        sql::delete_job::delete_all_jobs_and_bundles(
            &self.inner.pg_pool,
            &self.inner.escaped_schema,
        )
        .await
    }

    ////////////////////////////////////////////////////////////////////
    // Registry

    /// The registry of worker functions and retry schedulers; see
    /// [`Registry`] for the registration helpers.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    ////////////////////////////////////////////////////////////////////
    // Stopped listeners

    /// Registers a callback for every stopped job. The flag passed to the
    /// callback is true when the stop will be retried and is not final.
    ///
    /// The first registered listener of any kind starts the notification
    /// router.
    pub fn add_job_stopped_listener<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(Job, bool) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = self
            .inner
            .listeners
            .add_job_listener(Arc::new(callback) as JobStoppedCallback);
        self.ensure_router();
        Ok(id)
    }

    pub fn remove_job_stopped_listener(&self, id: ListenerId) {
        self.inner.listeners.remove_job_listener(id);
    }

    /// Registers a callback for every stopped bundle. The bundle passed to
    /// the callback is fully loaded with its jobs.
    pub fn add_bundle_stopped_listener<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(JobBundle) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = self
            .inner
            .listeners
            .add_bundle_listener(Arc::new(callback) as BundleStoppedCallback);
        self.ensure_router();
        Ok(id)
    }

    pub fn remove_bundle_stopped_listener(&self, id: ListenerId) {
        self.inner.listeners.remove_bundle_listener(id);
    }

    /// Registers the single callback for stopped bundles of one type,
    /// replacing any previous one.
    pub fn set_bundle_type_stopped_listener<F>(&self, bundle_type: &str, callback: F) -> Result<()>
    where
        F: Fn(JobBundle) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.inner
            .listeners
            .set_bundle_type_listener(bundle_type, Arc::new(callback) as BundleStoppedCallback);
        self.ensure_router();
        Ok(())
    }

    pub fn remove_bundle_type_stopped_listener(&self, bundle_type: &str) {
        self.inner.listeners.remove_bundle_type_listener(bundle_type);
    }

    pub fn remove_all_bundle_stopped_listeners(&self) {
        self.inner.listeners.remove_all_bundle_listeners();
    }

    fn ensure_router(&self) {
        let mut router_task = self
            .inner
            .router_task
            .lock()
            .expect("router task poisoned");
        if router_task.is_some() {
            return;
        }

        let pg_pool = self.inner.pg_pool.clone();
        let escaped_schema = self.inner.escaped_schema.clone();
        let listeners = Arc::clone(&self.inner.listeners);
        let closed = Arc::clone(&self.inner.closed);
        *router_task = Some(tokio::spawn(async move {
            if let Err(e) =
                run_notification_router(pg_pool, escaped_schema, listeners, closed).await
            {
                error!("Notification router failed: {e}");
            }
        }));
    }

    ////////////////////////////////////////////////////////////////////
    // Worker pool lifecycle

    /// Starts `num_workers` worker tasks draining the queue.
    pub fn start_workers(&self, num_workers: usize) -> Result<()> {
        self.start_workers_with_cancel(CancellationToken::new(), num_workers)
    }

    /// Like [`JobQueue::start_workers`] with a caller-owned cancellation
    /// scope: cancelling it signals running jobs and unwinds the workers
    /// after they persist their in-flight outcome.
    pub fn start_workers_with_cancel(
        &self,
        cancel: CancellationToken,
        num_workers: usize,
    ) -> Result<()> {
        self.ensure_open()?;
        self.inner.worker_pool.clone().start(cancel, num_workers)
    }

    /// Default worker count for this machine.
    pub fn default_worker_count() -> usize {
        num_cpus::get()
    }

    /// Stops accepting work, waits for in-flight jobs to complete.
    /// Idempotent.
    pub async fn finish_workers(&self) {
        self.inner.worker_pool.finish().await
    }

    /// Stops accepting work without waiting for in-flight jobs.
    /// Idempotent.
    pub fn stop_workers(&self) {
        self.inner.worker_pool.stop()
    }

    /// Wakes the workers every `interval` independently of notifications.
    pub fn start_polling(&self, interval: Duration) -> Result<()> {
        self.ensure_open()?;
        self.inner.worker_pool.clone().start_polling(interval)
    }

    /// Stops all polling tickers.
    pub fn stop_polling(&self) {
        self.inner.worker_pool.stop_polling()
    }

    /// Closes the queue: stops workers and the notification router; every
    /// subsequent operation returns [`JobQueueError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(JobQueueError::Closed);
        }

        self.inner.worker_pool.stop();
        if let Some(task) = self
            .inner
            .router_task
            .lock()
            .expect("router task poisoned")
            .take()
        {
            task.abort();
        }

        info!("Job queue closed");
        Ok(())
    }
}
