//! Embedded schema migrations.
//!
//! Each entry is a list of statements executed inside one transaction.
//! `:JOBQUEUE_SCHEMA` is replaced with the escaped schema name at
//! execution time.

pub const MIGRATIONS: &[&[&str]] = &[M000001, M000002];

/// The `job` and `job_bundle` tables with their invariants.
const M000001: &[&str] = &[
    r#"
        create table :JOBQUEUE_SCHEMA.job_bundle (
            id uuid primary key,
            "type" text not null check (length("type") > 0),
            origin text not null check (length(origin) > 0),
            num_jobs int not null check (num_jobs > 0),
            num_jobs_stopped int not null default 0
                check (num_jobs_stopped >= 0 and num_jobs_stopped <= num_jobs),
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now()
        );
    "#,
    r#"
        create table :JOBQUEUE_SCHEMA.job (
            id uuid primary key,
            bundle_id uuid references :JOBQUEUE_SCHEMA.job_bundle (id) on delete cascade,
            "type" text not null check (length("type") > 0 and length("type") <= 100),
            payload json not null,
            priority bigint not null default 0,
            origin text not null check (length(origin) > 0 and length(origin) <= 100),
            max_retry_count int not null default 0 check (max_retry_count >= 0),
            current_retry_count int not null default 0 check (current_retry_count >= 0),
            start_at timestamptz,
            started_at timestamptz,
            stopped_at timestamptz,
            error_msg text check (error_msg is null or length(error_msg) > 0),
            error_data json,
            result json,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            check (current_retry_count <= max_retry_count)
        );
    "#,
    r#"
        create index job_claim_order_idx
            on :JOBQUEUE_SCHEMA.job (priority desc, created_at asc)
            where started_at is null;
    "#,
    r#"
        create index job_bundle_id_idx on :JOBQUEUE_SCHEMA.job (bundle_id)
            where bundle_id is not null;
    "#,
];

/// Notification triggers. Emission is the database's responsibility; the
/// queue process only listens and decodes.
const M000002: &[&str] = &[
    // Fired on insert of a pending job and on every transition back to
    // pending (retry scheduling, reset). The payload is ignored by
    // listeners, the ping itself is the signal.
    r#"
        create function :JOBQUEUE_SCHEMA.notify_job_available() returns trigger as $$
        begin
            if tg_op = 'INSERT' then
                if new.started_at is null then
                    perform pg_notify('job_available', '');
                end if;
            elsif new.started_at is null and old.started_at is not null then
                perform pg_notify('job_available', '');
            end if;
            return new;
        end;
        $$ language plpgsql;
    "#,
    r#"
        create trigger job_available_trigger
            after insert or update on :JOBQUEUE_SCHEMA.job
            for each row execute function :JOBQUEUE_SCHEMA.notify_job_available();
    "#,
    r#"
        create function :JOBQUEUE_SCHEMA.notify_job_stopped() returns trigger as $$
        begin
            if new.stopped_at is not null and old.stopped_at is null then
                perform pg_notify('job_stopped', row_to_json(new)::text);
            end if;
            return new;
        end;
        $$ language plpgsql;
    "#,
    r#"
        create trigger job_stopped_trigger
            after update on :JOBQUEUE_SCHEMA.job
            for each row execute function :JOBQUEUE_SCHEMA.notify_job_stopped();
    "#,
    r#"
        create function :JOBQUEUE_SCHEMA.notify_job_bundle_stopped() returns trigger as $$
        begin
            if new.num_jobs_stopped = new.num_jobs
                and old.num_jobs_stopped < new.num_jobs_stopped then
                perform pg_notify('job_bundle_stopped', row_to_json(new)::text);
            end if;
            return new;
        end;
        $$ language plpgsql;
    "#,
    r#"
        create trigger job_bundle_stopped_trigger
            after update on :JOBQUEUE_SCHEMA.job_bundle
            for each row execute function :JOBQUEUE_SCHEMA.notify_job_bundle_stopped();
    "#,
];
