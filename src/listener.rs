//! Server-to-client notification routing.
//!
//! The database emits three channel pings (via triggers): `job_available`
//! wakes workers, `job_stopped` and `job_bundle_stopped` carry the full
//! row as JSON and are fanned out to in-process listeners. This module
//! owns the stopped-listener side; the `job_available` subscription lives
//! with the worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, error, warn};

use crate::bundle::JobBundle;
use crate::errors::Result;
use crate::job::Job;
use crate::sql::delete_job::delete_bundle;
use crate::sql::get_job::get_bundle_with_jobs;

/// Pinged on insert of a pending job and on every transition back to
/// pending. Payload ignored.
pub const JOB_AVAILABLE_CHANNEL: &str = "job_available";
/// Carries the stopped job row serialized as JSON.
pub const JOB_STOPPED_CHANNEL: &str = "job_stopped";
/// Carries the bundle row serialized as JSON once all its jobs stopped.
pub const JOB_BUNDLE_STOPPED_CHANNEL: &str = "job_bundle_stopped";

/// Handle returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Called with the stopped job and whether this stop will be retried
/// (error present and retry budget remaining), meaning it is not final.
pub type JobStoppedCallback = Arc<dyn Fn(Job, bool) + Send + Sync>;

/// Called with the fully-loaded bundle once all of its jobs stopped.
pub type BundleStoppedCallback = Arc<dyn Fn(JobBundle) + Send + Sync>;

/// In-process listener collections.
///
/// Mutations take the write lock; dispatch snapshots under the read lock
/// and releases it before any callback runs, so callbacks may re-enter
/// the registration API without deadlocking.
#[derive(Default)]
pub(crate) struct StoppedListeners {
    next_id: AtomicU64,
    job: RwLock<Vec<(u64, JobStoppedCallback)>>,
    bundle: RwLock<Vec<(u64, BundleStoppedCallback)>>,
    bundle_by_type: RwLock<HashMap<String, BundleStoppedCallback>>,
}

impl StoppedListeners {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_job_listener(&self, callback: JobStoppedCallback) -> ListenerId {
        let id = self.next_id();
        self.job
            .write()
            .expect("job listeners poisoned")
            .push((id, callback));
        ListenerId(id)
    }

    pub(crate) fn remove_job_listener(&self, id: ListenerId) {
        self.job
            .write()
            .expect("job listeners poisoned")
            .retain(|(listener_id, _)| *listener_id != id.0);
    }

    pub(crate) fn add_bundle_listener(&self, callback: BundleStoppedCallback) -> ListenerId {
        let id = self.next_id();
        self.bundle
            .write()
            .expect("bundle listeners poisoned")
            .push((id, callback));
        ListenerId(id)
    }

    pub(crate) fn remove_bundle_listener(&self, id: ListenerId) {
        self.bundle
            .write()
            .expect("bundle listeners poisoned")
            .retain(|(listener_id, _)| *listener_id != id.0);
    }

    pub(crate) fn set_bundle_type_listener(
        &self,
        bundle_type: impl Into<String>,
        callback: BundleStoppedCallback,
    ) {
        self.bundle_by_type
            .write()
            .expect("bundle type listeners poisoned")
            .insert(bundle_type.into(), callback);
    }

    pub(crate) fn remove_bundle_type_listener(&self, bundle_type: &str) {
        self.bundle_by_type
            .write()
            .expect("bundle type listeners poisoned")
            .remove(bundle_type);
    }

    pub(crate) fn remove_all_bundle_listeners(&self) {
        self.bundle
            .write()
            .expect("bundle listeners poisoned")
            .clear();
        self.bundle_by_type
            .write()
            .expect("bundle type listeners poisoned")
            .clear();
    }

    fn job_callbacks(&self) -> Vec<JobStoppedCallback> {
        self.job
            .read()
            .expect("job listeners poisoned")
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn bundle_callbacks(&self) -> Vec<BundleStoppedCallback> {
        self.bundle
            .read()
            .expect("bundle listeners poisoned")
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn bundle_type_callback(&self, bundle_type: &str) -> Option<BundleStoppedCallback> {
        self.bundle_by_type
            .read()
            .expect("bundle type listeners poisoned")
            .get(bundle_type)
            .cloned()
    }

    /// Fans a synchronously-executed bundle out to its listeners, since no
    /// database notification will ever fire for it.
    pub(crate) fn dispatch_bundle_inline(&self, bundle: &JobBundle) {
        for callback in self.bundle_callbacks() {
            callback(bundle.clone());
        }
        if let Some(callback) = self.bundle_type_callback(bundle.bundle_type()) {
            callback(bundle.clone());
        }
    }
}

/// The router task: subscribes to the stopped channels, decodes payloads
/// and fans out. Spawned on first listener registration.
///
/// Each notification is handled in a freshly spawned task so that no
/// producer's cancellation scope ever reaches the observers, and so a
/// slow callback does not hold up the listen connection.
pub(crate) async fn run_notification_router(
    pg_pool: PgPool,
    escaped_schema: String,
    listeners: Arc<StoppedListeners>,
    closed: Arc<AtomicBool>,
) -> Result<()> {
    let mut pg_listener = PgListener::connect_with(&pg_pool).await?;
    pg_listener
        .listen_all([JOB_STOPPED_CHANNEL, JOB_BUNDLE_STOPPED_CHANNEL])
        .await?;
    debug!("Listening for stopped notifications");

    loop {
        let notification = pg_listener.recv().await?;
        if closed.load(Ordering::Relaxed) {
            return Ok(());
        }

        match notification.channel() {
            JOB_STOPPED_CHANNEL => {
                let job: Job = match serde_json::from_str(notification.payload()) {
                    Ok(job) => job,
                    Err(e) => {
                        error!("Could not decode job_stopped payload: {e}");
                        continue;
                    }
                };
                let callbacks = listeners.job_callbacks();
                tokio::spawn(async move {
                    let will_retry = job.will_retry();
                    for callback in callbacks {
                        callback(job.clone(), will_retry);
                    }
                });
            }
            JOB_BUNDLE_STOPPED_CHANNEL => {
                let bundle: JobBundle = match serde_json::from_str(notification.payload()) {
                    Ok(bundle) => bundle,
                    Err(e) => {
                        error!("Could not decode job_bundle_stopped payload: {e}");
                        continue;
                    }
                };
                tokio::spawn(handle_bundle_stopped(
                    pg_pool.clone(),
                    escaped_schema.clone(),
                    listeners.clone(),
                    bundle,
                ));
            }
            other => {
                warn!(channel = other, "Notification on unexpected channel");
            }
        }
    }
}

/// Default bundle fan-out: fetch the full bundle with all its jobs,
/// notify listeners, and auto-delete the bundle iff none of its jobs
/// errored.
async fn handle_bundle_stopped(
    pg_pool: PgPool,
    escaped_schema: String,
    listeners: Arc<StoppedListeners>,
    bundle_row: JobBundle,
) {
    let bundle_id = *bundle_row.id();

    let bundle = match get_bundle_with_jobs(&pg_pool, &escaped_schema, bundle_id).await {
        Ok(Some(bundle)) => bundle,
        Ok(None) => {
            warn!(%bundle_id, "Bundle stopped notification for an already deleted bundle");
            return;
        }
        Err(e) => {
            error!(%bundle_id, "Could not load stopped bundle: {e}");
            return;
        }
    };

    for callback in listeners.bundle_callbacks() {
        callback(bundle.clone());
    }
    if let Some(callback) = listeners.bundle_type_callback(bundle.bundle_type()) {
        callback(bundle.clone());
    }

    if !bundle.has_error() {
        if let Err(e) = delete_bundle(&pg_pool, &escaped_schema, bundle_id).await {
            error!(%bundle_id, "Could not delete finished bundle: {e}");
        } else {
            debug!(%bundle_id, "Deleted finished bundle");
        }
    }
}
