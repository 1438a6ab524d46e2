use sqlx::{query, Acquire, Error as SqlxError, Executor, Postgres, Row};
use tracing::info;

use crate::errors::Result;

async fn install_schema<'e, E>(executor: E, escaped_schema: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres> + Clone,
{
    info!(schema = escaped_schema, "Installing job queue schema");

    let create_schema_query = format!("create schema {escaped_schema};");
    let create_migration_table_query = format!(
        r#"
            create table {escaped_schema}.migrations (
                id int primary key,
                ts timestamptz default now() not null
            );
        "#
    );

    let mut tx = executor.begin().await?;
    query(&create_schema_query).execute(&mut *tx).await?;
    query(&create_migration_table_query)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

/// Brings the schema up to date, creating it on first use.
///
/// Each pending migration runs in its own transaction and is recorded in
/// the `migrations` table, so concurrent or repeated calls are safe.
pub async fn migrate<'e, E>(executor: E, escaped_schema: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres> + Send + Sync + Clone,
{
    let migrations_status_query =
        format!("select id from {escaped_schema}.migrations order by id desc limit 1");
    let last_migration_query_result = query(&migrations_status_query)
        .fetch_optional(executor.clone())
        .await;

    let last_migration: Option<i32> = match last_migration_query_result {
        Err(SqlxError::Database(e)) => {
            let Some(code) = e.code() else {
                return Err(SqlxError::Database(e).into());
            };

            // 42P01 : undefined_table
            if code == "42P01" {
                install_schema(executor.clone(), escaped_schema).await?;
            } else {
                return Err(SqlxError::Database(e).into());
            }

            None
        }
        Err(e) => {
            return Err(e.into());
        }
        Ok(optional_row) => optional_row.map(|row| row.get("id")),
    };

    for (i, migration_statements) in crate::migrations::MIGRATIONS.iter().enumerate() {
        let migration_number = (i + 1) as i32;

        if last_migration.is_none() || migration_number > last_migration.unwrap() {
            info!(migration_number, "Executing migration");
            let mut tx = executor.clone().begin().await?;

            for migration_statement in migration_statements.iter() {
                let sql = migration_statement.replace(":JOBQUEUE_SCHEMA", escaped_schema);
                query(sql.as_str()).execute(&mut *tx).await?;
            }

            query(format!("insert into {escaped_schema}.migrations (id) values ($1)").as_str())
                .bind(migration_number)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
        }
    }

    Ok(())
}
