use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use pg_jobqueue::{Job, JobBundle, JobDesc};
use serde_json::json;

use crate::helpers::{wait_until, with_test_db, WAIT_POLL, WAIT_TIMEOUT};

mod helpers;

#[tokio::test]
async fn status_and_listings_reflect_queue_content() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        let soon = Job::new("a", "origin-1", json!({}), None).unwrap();
        let later = Job::new("b", "origin-2", json!({}), Some(Utc::now() + ChronoDuration::hours(1)))
            .unwrap();
        let soon_id = *soon.id();
        queue.add_job(soon).await.unwrap();
        queue.add_job(later).await.unwrap();

        let descs = vec![JobDesc::new("c", "origin-1", json!({})).unwrap()];
        let bundle = JobBundle::new("batch", "origin-1", descs, None).unwrap();
        queue.add_bundle(bundle).await.unwrap();

        let status = queue.get_status().await.unwrap();
        assert_eq!(*status.num_jobs(), 3);
        assert_eq!(*status.num_bundles(), 1);

        // unscheduled jobs sort before scheduled ones
        let to_do = queue.jobs_to_do().await.unwrap();
        assert_eq!(to_do.len(), 3);
        assert_eq!(*to_do.first().unwrap().id(), soon_id);
        assert!(to_do.last().unwrap().start_at().is_some());

        assert!(queue.jobs_with_errors().await.unwrap().is_empty());
        assert!(queue
            .jobs_started_before(Utc::now())
            .await
            .unwrap()
            .is_empty());
    })
    .await;
}

#[tokio::test]
async fn deletes_by_key_origin_and_type() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        let by_id = Job::new("a", "origin-1", json!({}), None).unwrap();
        let by_id_key = *by_id.id();
        queue.add_job(by_id).await.unwrap();
        queue
            .add_job(Job::new("a", "origin-2", json!({}), None).unwrap())
            .await
            .unwrap();
        queue
            .add_job(Job::new("b", "origin-2", json!({}), None).unwrap())
            .await
            .unwrap();

        assert_eq!(queue.delete_job(by_id_key).await.unwrap(), 1);
        assert_eq!(queue.delete_jobs_of_type("a").await.unwrap(), 1);
        assert_eq!(queue.delete_jobs_from_origin("origin-2").await.unwrap(), 1);
        assert_eq!(*queue.get_status().await.unwrap().num_jobs(), 0);

        let descs = vec![JobDesc::new("c", "origin-3", json!({})).unwrap()];
        queue
            .add_bundle(JobBundle::new("batch", "origin-3", descs, None).unwrap())
            .await
            .unwrap();
        // deleting the bundle cascades to its member jobs
        assert_eq!(queue.delete_bundles_of_type("batch").await.unwrap(), 1);
        let status = queue.get_status().await.unwrap();
        assert_eq!(*status.num_jobs(), 0);
        assert_eq!(*status.num_bundles(), 0);
    })
    .await;
}

#[tokio::test]
async fn delete_finished_jobs_skips_errored_and_bundled() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        queue
            .registry()
            .register_worker_fn("ok", |_ctx, _p: serde_json::Value| async move {
                Ok::<_, String>(())
            })
            .unwrap();
        queue
            .registry()
            .register_worker_fn("bad", |_ctx, _p: serde_json::Value| async move {
                Err::<(), String>("nope".into())
            })
            .unwrap();

        let finished = Job::new("ok", "test", json!({}), None).unwrap();
        let errored = Job::new("bad", "test", json!({}), None).unwrap();
        let finished_id = *finished.id();
        let errored_id = *errored.id();
        queue.add_job(finished).await.unwrap();
        queue.add_job(errored).await.unwrap();

        let descs = vec![JobDesc::new("ok", "test", json!({})).unwrap()];
        let bundle = JobBundle::new("batch", "test", descs, None).unwrap();
        let bundled_id = *bundle.jobs()[0].id();
        queue.add_bundle(bundle).await.unwrap();

        queue.start_workers(2).unwrap();
        wait_until(WAIT_TIMEOUT, WAIT_POLL, {
            let queue = queue.clone();
            move || {
                let queue = queue.clone();
                async move {
                    let jobs_to_do = queue.jobs_to_do().await.unwrap();
                    jobs_to_do.is_empty()
                }
            }
        })
        .await;
        queue.finish_workers().await;

        let deleted = queue.delete_finished_jobs().await.unwrap();
        assert_eq!(deleted, 1);

        assert!(queue.get_job(finished_id).await.unwrap().is_none());
        // kept: the error is operator-visible state
        assert!(queue.get_job(errored_id).await.unwrap().is_some());
        // kept: bundle members are cleaned up with their bundle
        assert!(queue.get_job(bundled_id).await.unwrap().is_some());
    })
    .await;
}

#[tokio::test]
async fn job_stopped_listener_sees_retries_and_final_stop() {
    with_test_db(|test_db| async move {
        let queue = test_db.queue().await;

        queue
            .registry()
            .register_worker("retry_once", |ctx| async move {
                if *ctx.job().current_retry_count() == 0 {
                    Err("first attempt fails".into())
                } else {
                    Ok(Some(json!("ok")))
                }
            })
            .unwrap();
        queue
            .registry()
            .register_retry_scheduler("retry_once", |_ctx| async move { Ok(Utc::now()) })
            .unwrap();

        let stops: Arc<Mutex<Vec<(bool, bool)>>> = Arc::default();
        queue
            .add_job_stopped_listener({
                let stops = stops.clone();
                move |job, will_retry| {
                    stops.lock().unwrap().push((job.has_error(), will_retry));
                }
            })
            .unwrap();

        let job = Job::new("retry_once", "test", json!({}), None)
            .unwrap()
            .with_max_retry_count(1);
        queue.add_job(job).await.unwrap();
        queue.start_workers(1).unwrap();

        wait_until(WAIT_TIMEOUT, WAIT_POLL, {
            let stops = stops.clone();
            move || {
                let seen = stops.lock().unwrap().len() >= 2;
                async move { seen }
            }
        })
        .await;

        let stops = stops.lock().unwrap().clone();
        // first stop: errored with budget left, a retry follows
        assert_eq!(stops[0], (true, true));
        // second stop: clean success, final
        assert_eq!(stops[1], (false, false));

        queue.finish_workers().await;
    })
    .await;
}
