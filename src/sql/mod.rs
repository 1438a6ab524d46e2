//! All SQL statements against the `job` and `job_bundle` tables.
//!
//! Every function takes the escaped schema name; multi-row updates that
//! span both tables run inside one transaction.

pub mod claim_job;
pub mod complete_job;
pub mod delete_job;
pub mod get_job;
pub mod insert_job;
pub mod queue_details;
pub mod reset_job;
