use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{JobQueueError, Result};
use crate::job::{Job, JobDesc};

/// A group of related jobs created together and tracked as one unit.
///
/// The database maintains `num_jobs_stopped`; once it reaches `num_jobs`
/// the `job_bundle_stopped` notification fires exactly once and the bundle
/// becomes eligible for auto-deletion if none of its jobs errored.
#[derive(FromRow, Getters, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct JobBundle {
    id: Uuid,
    /// Categorizes the bundle for filtering and by-type listeners
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    bundle_type: String,
    /// Source or context that created the bundle
    origin: String,
    /// Total number of jobs, fixed at creation
    num_jobs: i32,
    /// How many jobs have reached a final state
    num_jobs_stopped: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// The member jobs; not stored on the bundle row itself.
    /// Filled by `get_bundle`, empty on decoded notifications.
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    jobs: Vec<Job>,
}

impl JobBundle {
    /// Creates a bundle and all of its member jobs client-side.
    ///
    /// A job is created for every [`JobDesc`]; each job's `bundle_id` is
    /// stamped with the new bundle id so the whole group can be inserted
    /// atomically. If `start_at` is set, none of the jobs will start before
    /// that time.
    pub fn new(
        bundle_type: impl Into<String>,
        origin: impl Into<String>,
        job_descriptions: Vec<JobDesc>,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<JobBundle> {
        let bundle_type = bundle_type.into();
        let origin = origin.into();
        if bundle_type.is_empty() {
            return Err(JobQueueError::InvalidBundle("empty bundle type".into()));
        }
        if origin.is_empty() {
            return Err(JobQueueError::InvalidBundle("empty origin".into()));
        }
        if job_descriptions.is_empty() {
            return Err(JobQueueError::InvalidBundle("no job descriptions".into()));
        }

        let id = Uuid::now_v7();
        let num_jobs = job_descriptions.len() as i32;
        let mut jobs = Vec::with_capacity(job_descriptions.len());
        for desc in job_descriptions {
            let mut job = Job::new_with_priority(
                desc.job_type,
                desc.origin,
                desc.payload,
                desc.priority,
                start_at,
            )?;
            job.set_bundle_id(id);
            jobs.push(job);
        }

        let now = Utc::now();
        Ok(JobBundle {
            id,
            bundle_type,
            origin,
            num_jobs,
            num_jobs_stopped: 0,
            created_at: now,
            updated_at: now,
            jobs,
        })
    }

    /// Returns true if any of the bundle's loaded jobs has an error.
    pub fn has_error(&self) -> bool {
        self.jobs.iter().any(|job| job.has_error())
    }

    /// Returns true once every job in the bundle has reached a final state.
    pub fn is_stopped(&self) -> bool {
        self.num_jobs_stopped >= self.num_jobs
    }

    pub(crate) fn with_jobs(mut self, jobs: Vec<Job>) -> JobBundle {
        self.jobs = jobs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(n: usize) -> Vec<JobDesc> {
        (0..n)
            .map(|i| JobDesc::new("member", "test", serde_json::json!({ "i": i })).unwrap())
            .collect()
    }

    #[test]
    fn new_bundle_stamps_member_jobs() {
        let bundle = JobBundle::new("import", "test", descs(3), None).unwrap();
        assert_eq!(*bundle.num_jobs(), 3);
        assert_eq!(*bundle.num_jobs_stopped(), 0);
        assert!(!bundle.is_stopped());
        for job in bundle.jobs() {
            assert_eq!(*job.bundle_id(), Some(*bundle.id()));
        }
    }

    #[test]
    fn new_bundle_rejects_empty_input() {
        assert!(JobBundle::new("import", "test", vec![], None).is_err());
        assert!(JobBundle::new("", "test", descs(1), None).is_err());
        assert!(JobBundle::new("import", "", descs(1), None).is_err());
    }

    #[test]
    fn has_error_scans_member_jobs() {
        let mut bundle = JobBundle::new("import", "test", descs(2), None).unwrap();
        assert!(!bundle.has_error());

        let failed = Job::builder()
            .job_type("member")
            .origin("test")
            .error_msg(Some("boom".into()))
            .build();
        bundle = bundle.with_jobs(vec![failed]);
        assert!(bundle.has_error());
    }
}
