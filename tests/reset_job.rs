use pg_jobqueue::{Job, JobBundle, JobDesc};
use serde_json::json;

use crate::helpers::{wait_until, with_test_db, WAIT_POLL, WAIT_TIMEOUT};

mod helpers;

#[tokio::test]
async fn reset_of_pending_job_is_a_noop_on_the_counter() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        let descs = vec![
            JobDesc::new("member", "test", json!({"i": 0})).unwrap(),
            JobDesc::new("member", "test", json!({"i": 1})).unwrap(),
        ];
        let bundle = JobBundle::new("batch", "test", descs, None).unwrap();
        let bundle_id = *bundle.id();
        let job_id = *bundle.jobs()[0].id();
        queue.add_bundle(bundle).await.unwrap();

        // nothing ran: the member is still pending and was never counted
        let reset = queue.reset_job(job_id).await.unwrap();
        assert_eq!(reset, 1);

        let bundle_row = test_db.get_bundle_row(bundle_id).await.unwrap();
        assert_eq!(bundle_row.num_jobs_stopped, 0);
    })
    .await;
}

#[tokio::test]
async fn reset_of_succeeded_bundle_member_decrements_counter() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        queue
            .registry()
            .register_worker_fn("member", |_ctx, _payload: serde_json::Value| async move {
                Ok::<_, String>("ok")
            })
            .unwrap();

        let descs = vec![
            JobDesc::new("member", "test", json!({"i": 0})).unwrap(),
            JobDesc::new("member", "test", json!({"i": 1})).unwrap(),
        ];
        let bundle = JobBundle::new("batch", "test", descs, None).unwrap();
        let bundle_id = *bundle.id();
        let job_id = *bundle.jobs()[0].id();
        queue.add_bundle(bundle).await.unwrap();
        queue.start_workers(2).unwrap();

        wait_until(WAIT_TIMEOUT, WAIT_POLL, {
            let test_db = test_db.clone();
            move || {
                let test_db = test_db.clone();
                async move {
                    test_db
                        .get_bundle_row(bundle_id)
                        .await
                        .map(|bundle| bundle.num_jobs_stopped == 2)
                        .unwrap_or(false)
                }
            }
        })
        .await;
        queue.finish_workers().await;

        let reset = queue.reset_job(job_id).await.unwrap();
        assert_eq!(reset, 1);

        let bundle_row = test_db.get_bundle_row(bundle_id).await.unwrap();
        assert_eq!(bundle_row.num_jobs_stopped, 1);

        let row = test_db.get_job_row(job_id).await.unwrap();
        assert!(row.started_at.is_none());
        assert!(row.stopped_at.is_none());
        assert!(row.result.is_none());
    })
    .await;
}

#[tokio::test]
async fn reset_clears_a_finally_failed_job() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        queue
            .registry()
            .register_worker_fn("failing", |_ctx, _payload: serde_json::Value| async move {
                Err::<(), String>("nope".into())
            })
            .unwrap();

        let job = Job::new("failing", "test", json!({}), None).unwrap();
        let job_id = *job.id();
        queue.add_job(job).await.unwrap();
        queue.start_workers(1).unwrap();

        wait_until(WAIT_TIMEOUT, WAIT_POLL, {
            let queue = queue.clone();
            move || {
                let queue = queue.clone();
                async move {
                    queue
                        .get_job(job_id)
                        .await
                        .unwrap()
                        .map(|job| job.is_stopped())
                        .unwrap_or(false)
                }
            }
        })
        .await;
        queue.finish_workers().await;

        queue.reset_job(job_id).await.unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert!(!job.is_started());
        assert!(!job.is_stopped());
        assert!(!job.has_error());
        assert!(job.result().is_none());
    })
    .await;
}

#[tokio::test]
async fn reset_of_unknown_job_resets_nothing() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;
        let reset = queue.reset_job(uuid::Uuid::now_v7()).await.unwrap();
        assert_eq!(reset, 0);
    })
    .await;
}
