use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::JobContext;
use crate::errors::{JobQueueError, Result};
use crate::job::job_type_of;

/// The canonical worker function form: takes the job context, returns the
/// optional JSON result or an error message that will be persisted as the
/// job's `error_msg`.
pub type WorkerFn = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = core::result::Result<Option<Value>, String>> + Send>>
        + Send
        + Sync,
>;

/// Maps a failed job to the instant its next attempt may start.
pub type RetrySchedulerFn = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = core::result::Result<DateTime<Utc>, String>> + Send>>
        + Send
        + Sync,
>;

/// Maps job type strings to worker functions and retry schedulers.
///
/// The claim query only considers types present in the worker map, so a
/// process never claims rows it cannot handle. Registration is append-only
/// per type string; re-registering an existing type is a configuration
/// error.
#[derive(Default)]
pub struct Registry {
    workers: RwLock<HashMap<String, WorkerFn>>,
    retry_schedulers: RwLock<HashMap<String, RetrySchedulerFn>>,
}

impl Registry {
    /// Registers a worker function in its canonical form.
    pub fn register_worker<F, Fut>(&self, job_type: impl Into<String>, worker_fn: F) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<Option<Value>, String>> + Send + 'static,
    {
        let job_type = job_type.into();
        let mut workers = self.workers.write().expect("worker registry poisoned");
        if workers.contains_key(&job_type) {
            return Err(JobQueueError::WorkerAlreadyRegistered(job_type));
        }
        workers.insert(
            job_type,
            Arc::new(move |ctx: JobContext| worker_fn(ctx).boxed()),
        );
        Ok(())
    }

    /// Registers a worker taking a payload decoded from the job's JSON.
    ///
    /// A synthesized wrapper deserializes `job.payload` into `T`; a decode
    /// failure becomes the job's error. The returned value is serialized
    /// as the job result, with `null` treated as no result.
    pub fn register_worker_fn<T, R, E, Fut, F>(
        &self,
        job_type: impl Into<String>,
        job_fn: F,
    ) -> Result<()>
    where
        T: for<'de> Deserialize<'de> + Send + 'static,
        R: Serialize,
        E: Display,
        Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
    {
        let job_fn = Arc::new(job_fn);
        self.register_worker(job_type, move |ctx: JobContext| {
            let job_fn = job_fn.clone();
            async move {
                let payload = ctx.job().payload().clone();
                let decoded = match serde_json::from_value::<T>(payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        return Err(format!(
                            "error while unmarshalling job payload '{}': {e}",
                            ctx.job().payload()
                        ))
                    }
                };
                match job_fn(ctx, decoded).await {
                    Err(e) => Err(e.to_string()),
                    Ok(result) => match serde_json::to_value(result) {
                        Err(e) => Err(format!("error while marshalling job result: {e}")),
                        Ok(Value::Null) => Ok(None),
                        Ok(value) => Ok(Some(value)),
                    },
                }
            }
        })
    }

    /// Like [`Registry::register_worker_fn`] with the job type derived
    /// from the payload's type identity.
    pub fn register_worker_for_payload<T, R, E, Fut, F>(&self, job_fn: F) -> Result<()>
    where
        T: for<'de> Deserialize<'de> + Send + 'static,
        R: Serialize,
        E: Display,
        Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
    {
        self.register_worker_fn(job_type_of::<T>(), job_fn)
    }

    /// Registers the retry scheduler consulted when a job of this type
    /// fails with retry budget remaining.
    pub fn register_retry_scheduler<F, Fut>(
        &self,
        job_type: impl Into<String>,
        scheduler_fn: F,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<DateTime<Utc>, String>> + Send + 'static,
    {
        let job_type = job_type.into();
        let mut schedulers = self
            .retry_schedulers
            .write()
            .expect("retry scheduler registry poisoned");
        if schedulers.contains_key(&job_type) {
            return Err(JobQueueError::RetrySchedulerAlreadyRegistered(job_type));
        }
        schedulers.insert(
            job_type,
            Arc::new(move |ctx: JobContext| scheduler_fn(ctx).boxed()),
        );
        Ok(())
    }

    /// Removes the worker functions for the given job types, or all of
    /// them when the slice is empty. Retry schedulers stay registered.
    pub fn unregister(&self, job_types: &[&str]) {
        let mut workers = self.workers.write().expect("worker registry poisoned");
        if job_types.is_empty() {
            debug!("Unregistering all workers");
            workers.clear();
        } else {
            debug!(?job_types, "Unregistering workers");
            for job_type in job_types {
                workers.remove(*job_type);
            }
        }
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .contains_key(job_type)
    }

    /// Snapshot of all registered job types, consumed by the claim query.
    pub fn registered_types(&self) -> Vec<String> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn get_worker(&self, job_type: &str) -> Option<WorkerFn> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .get(job_type)
            .cloned()
    }

    pub(crate) fn get_retry_scheduler(&self, job_type: &str) -> Option<RetrySchedulerFn> {
        self.retry_schedulers
            .read()
            .expect("retry scheduler registry poisoned")
            .get(job_type)
            .cloned()
    }
}
