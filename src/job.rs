use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{JobQueueError, Result};

/// A unit of asynchronous work.
///
/// `Job` values are immutable snapshots of the durable row. They are fully
/// materialized client-side (including the id) before insertion and re-read
/// from the database afterwards; mutating a snapshot never changes queue
/// state.
///
/// The lifecycle is derived from the nullable columns: a job is *pending*
/// while `started_at` is null, *running* once a worker has claimed it, and
/// stopped once `stopped_at` is set, either with a `result` or with an
/// `error_msg`.
#[derive(FromRow, Getters, Builder, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    /// Unique identifier, generated client-side
    #[builder(default = "Uuid::now_v7()")]
    id: Uuid,
    /// Bundle this job belongs to, if any
    #[builder(default)]
    bundle_id: Option<Uuid>,
    /// Job type string used to look up the worker function (1..=100 chars)
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    #[builder(default, setter(into))]
    job_type: String,
    /// The JSON payload of the job, immutable once inserted
    #[builder(default = "serde_json::json!({})")]
    payload: Value,
    /// Higher priority jobs are claimed first
    #[builder(default)]
    priority: i64,
    /// Source or context that created the job (1..=100 chars)
    #[builder(default, setter(into))]
    origin: String,
    /// How many times the job may be retried after an error
    #[builder(default)]
    max_retry_count: i32,
    /// How many retries have been scheduled so far
    #[builder(default)]
    current_retry_count: i32,
    /// If set, the job is not claimable before this instant
    #[builder(default)]
    start_at: Option<DateTime<Utc>>,
    /// When a worker claimed the job, or null while pending
    #[builder(default)]
    started_at: Option<DateTime<Utc>>,
    /// When working on the job stopped, or null while pending/running
    #[builder(default)]
    stopped_at: Option<DateTime<Utc>>,
    /// Error headline if the job stopped with an error
    #[builder(default)]
    error_msg: Option<String>,
    /// Optional structured error metadata
    #[builder(default)]
    error_data: Option<Value>,
    /// Result if the job returned one
    #[builder(default)]
    result: Option<Value>,
    #[builder(default = "Utc::now()")]
    created_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a builder for constructing a `Job` field by field.
    ///
    /// Mostly useful in tests; prefer [`Job::new`] for regular submission.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Creates a job with default priority but does not add it to the queue.
    ///
    /// The payload is marshalled to JSON. If `start_at` is set the job will
    /// not start before that time.
    pub fn new(
        job_type: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Serialize,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        Self::new_with_priority(job_type, origin, payload, 0, start_at)
    }

    /// Creates a job but does not add it to the queue.
    pub fn new_with_priority(
        job_type: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Serialize,
        priority: i64,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let payload = serde_json::to_value(payload)?;
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            bundle_id: None,
            job_type: job_type.into(),
            payload,
            priority,
            origin: origin.into(),
            max_retry_count: 0,
            current_retry_count: 0,
            start_at,
            started_at: None,
            stopped_at: None,
            error_msg: None,
            error_data: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        job.validate()?;
        Ok(job)
    }

    /// Returns a copy of the job with the given retry budget.
    pub fn with_max_retry_count(mut self, max_retry_count: i32) -> Job {
        self.max_retry_count = max_retry_count;
        self
    }

    pub(crate) fn set_bundle_id(&mut self, bundle_id: Uuid) {
        self.bundle_id = Some(bundle_id);
    }

    /// Checks the invariants enforced by the table constraints so that
    /// invalid jobs are rejected before they reach the database.
    pub fn validate(&self) -> Result<()> {
        if self.job_type.is_empty() {
            return Err(JobQueueError::InvalidJob("empty job type".into()));
        }
        if self.job_type.chars().count() > 100 {
            return Err(JobQueueError::InvalidJob(format!(
                "job type longer than 100 chars: '{}'",
                self.job_type
            )));
        }
        if self.origin.is_empty() {
            return Err(JobQueueError::InvalidJob("empty origin".into()));
        }
        if self.origin.chars().count() > 100 {
            return Err(JobQueueError::InvalidJob(format!(
                "origin longer than 100 chars: '{}'",
                self.origin
            )));
        }
        if self.max_retry_count < 0 || self.current_retry_count < 0 {
            return Err(JobQueueError::InvalidJob(
                "negative retry count".into(),
            ));
        }
        if self.current_retry_count > self.max_retry_count {
            return Err(JobQueueError::InvalidJob(format!(
                "current_retry_count {} greater than max_retry_count {}",
                self.current_retry_count, self.max_retry_count
            )));
        }
        if matches!(&self.error_msg, Some(msg) if msg.is_empty()) {
            return Err(JobQueueError::InvalidJob("empty error_msg".into()));
        }
        Ok(())
    }

    /// Returns true once a worker has claimed the job.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Returns true once working on the job has stopped, with or without error.
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Returns true if the job stopped with an error.
    pub fn has_error(&self) -> bool {
        self.error_msg.is_some()
    }

    /// Returns true if the job has been finished without an error.
    pub fn is_finished(&self) -> bool {
        self.is_stopped() && !self.has_error()
    }

    /// Returns true if the job stopped with an error but still has retry
    /// budget, meaning this is not its final stop.
    pub fn will_retry(&self) -> bool {
        self.has_error() && self.current_retry_count < self.max_retry_count
    }
}

impl JobBuilder {
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("all Job fields have defaults")
    }
}

/// A stable, fully-qualified job type string derived from a payload type.
///
/// Used by the `*_for_payload` registration and submission helpers so that
/// producer and worker agree on the type string without spelling it twice.
pub fn job_type_of<T>() -> String {
    std::any::type_name::<T>().to_string()
}

/// Describes a job to be created, typically when assembling a bundle.
#[derive(Debug, Clone)]
pub struct JobDesc {
    /// Job type string; see [`JobDesc::for_payload`] for the derived form.
    pub job_type: String,
    /// Job data, already marshalled to JSON.
    pub payload: Value,
    /// Higher values are processed first.
    pub priority: i64,
    /// Source or context that created the job.
    pub origin: String,
}

impl JobDesc {
    pub fn new(
        job_type: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<JobDesc> {
        Ok(JobDesc {
            job_type: job_type.into(),
            payload: serde_json::to_value(payload)?,
            priority: 0,
            origin: origin.into(),
        })
    }

    /// Derives the job type string from the payload's type identity.
    pub fn for_payload<T: Serialize>(origin: impl Into<String>, payload: &T) -> Result<JobDesc> {
        Ok(JobDesc {
            job_type: job_type_of::<T>(),
            payload: serde_json::to_value(payload)?,
            priority: 0,
            origin: origin.into(),
        })
    }

    pub fn with_priority(mut self, priority: i64) -> JobDesc {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_validates_type_and_origin() {
        assert!(Job::new("", "test", serde_json::json!({}), None).is_err());
        assert!(Job::new("t", "", serde_json::json!({}), None).is_err());
        assert!(Job::new("x".repeat(101), "test", serde_json::json!({}), None).is_err());

        let job = Job::new("report", "test", serde_json::json!({"a": 1}), None).unwrap();
        assert_eq!(job.job_type(), "report");
        assert_eq!(job.origin(), "test");
        assert_eq!(*job.priority(), 0);
        assert!(job.bundle_id().is_none());
        assert!(!job.is_started());
        assert!(!job.is_stopped());
    }

    #[test]
    fn builder_defaults_are_pending() {
        let job = Job::builder().job_type("t").origin("o").build();
        assert!(job.start_at().is_none());
        assert!(!job.is_started());
        assert!(!job.has_error());
        assert!(!job.will_retry());
        assert_eq!(*job.payload(), serde_json::json!({}));
    }

    #[test]
    fn retry_invariant_is_validated() {
        let job = Job::builder()
            .job_type("t")
            .origin("o")
            .current_retry_count(2)
            .max_retry_count(1)
            .build();
        assert!(job.validate().is_err());
    }

    #[test]
    fn will_retry_needs_error_and_budget() {
        let errored = Job::builder()
            .job_type("t")
            .origin("o")
            .stopped_at(Some(Utc::now()))
            .error_msg(Some("boom".into()))
            .max_retry_count(3)
            .build();
        assert!(errored.will_retry());
        assert!(!errored.is_finished());

        let exhausted = Job::builder()
            .job_type("t")
            .origin("o")
            .stopped_at(Some(Utc::now()))
            .error_msg(Some("boom".into()))
            .current_retry_count(3)
            .max_retry_count(3)
            .build();
        assert!(!exhausted.will_retry());
    }

    #[test]
    fn notification_payload_round_trips() {
        let job = Job::new("report", "test", serde_json::json!({"a": 1}), None).unwrap();
        let encoded = serde_json::to_string(&job).unwrap();
        assert!(encoded.contains("\"type\":\"report\""));
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn desc_for_payload_derives_type_name() {
        #[derive(Serialize)]
        struct SendMail {
            to: String,
        }

        let desc = JobDesc::for_payload(
            "test",
            &SendMail {
                to: "a@b.c".into(),
            },
        )
        .unwrap();
        assert_eq!(desc.job_type, job_type_of::<SendMail>());
        assert!(desc.job_type.ends_with("SendMail"));
    }
}
