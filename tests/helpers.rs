#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pg_jobqueue::{JobQueue, QueueOptions};
use sqlx::postgres::PgConnectOptions;
use sqlx::{FromRow, PgPool};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Raw `job` row for assertions that bypass the queue API.
#[derive(FromRow, Debug)]
pub struct JobRow {
    pub id: Uuid,
    pub bundle_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub priority: i64,
    pub origin: String,
    pub max_retry_count: i32,
    pub current_retry_count: i32,
    pub start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Raw `job_bundle` row for counter assertions.
#[derive(FromRow, Debug)]
pub struct BundleRow {
    pub id: Uuid,
    pub num_jobs: i32,
    pub num_jobs_stopped: i32,
}

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn queue_options(&self) -> QueueOptions {
        JobQueue::options()
            .pg_pool(self.test_pool.clone())
            .schema("jobqueue")
    }

    pub async fn queue(&self) -> JobQueue {
        self.queue_options()
            .init()
            .await
            .expect("Failed to init queue")
    }

    pub async fn get_job_row(&self, job_id: Uuid) -> Option<JobRow> {
        sqlx::query_as(
            r#"
                select id, bundle_id, "type", priority, origin, max_retry_count,
                       current_retry_count, start_at, started_at, stopped_at,
                       error_msg, result
                    from jobqueue.job
                    where id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.test_pool)
        .await
        .expect("Failed to get job row")
    }

    pub async fn get_bundle_row(&self, bundle_id: Uuid) -> Option<BundleRow> {
        sqlx::query_as(
            "select id, num_jobs, num_jobs_stopped from jobqueue.job_bundle where id = $1",
        )
        .bind(bundle_id)
        .fetch_optional(&self.test_pool)
        .await
        .expect("Failed to get bundle row")
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_pg_jobqueue");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = Uuid::now_v7();
    let db_name = format!("__test_pg_jobqueue_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let test_db = create_test_database().await;
    let test_db_2 = test_db.clone();

    let result = tokio::spawn(async move {
        test_fn(test_db_2).await;
    })
    .await;

    test_db.drop().await;
    result.expect("Test failed");
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, poll: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return;
        }
        if start.elapsed() > timeout {
            panic!("Timed out waiting for condition");
        }
        sleep(poll).await;
    }
}

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const WAIT_POLL: Duration = Duration::from_millis(50);

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}

async fn init_job_count() -> Mutex<u32> {
    Mutex::new(0)
}

impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // debug everywhere except sqlx, to not show every statement
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
