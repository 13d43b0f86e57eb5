//! SQLite UserRepository implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Alias, Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::storage::schema::{Users, CREATE_USERS_TABLE};
use crate::storage::{classify, Applied, Result, StorageError, UserRecord, UserRepository};

/// Transaction start that acquires the database write lock immediately.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

/// Row alias SQLite gives the proposed values inside `ON CONFLICT DO UPDATE`.
const EXCLUDED: &str = "excluded";

const COLUMNS: [Users; 6] = [
    Users::Id,
    Users::Email,
    Users::DisplayName,
    Users::CreatedAt,
    Users::UpdatedAt,
    Users::SourceVersion,
];

/// SQLite implementation of UserRepository.
pub struct SqliteUserRepository {
    pool: SqlitePool,
}

impl SqliteUserRepository {
    /// Create a new SQLite user repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the users table if missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_USERS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

/// Fixed-width UTC text so lexical order matches time order.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(id: &str, column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            id: id.to_string(),
            reason: format!("{}: {}", column, e),
        })
}

fn row_to_record(row: &SqliteRow) -> Result<UserRecord> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(UserRecord {
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        created_at: parse_timestamp(&id, "created_at", &created_at)?,
        updated_at: parse_timestamp(&id, "updated_at", &updated_at)?,
        source_version: row.try_get("source_version")?,
        id,
    })
}

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn upsert_if_newer(&self, record: &UserRecord) -> Result<Applied> {
        // Take the write lock up front so the read below cannot be
        // invalidated by a concurrent writer.
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;

        let (select_sql, select_values) = Query::select()
            .columns(COLUMNS)
            .from(Users::Table)
            .and_where(Expr::col(Users::Id).eq(record.id.as_str()))
            .build_sqlx(SqliteQueryBuilder);
        let stored = sqlx::query_with(&select_sql, select_values)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(row_to_record)
            .transpose()?;

        let applied = classify(stored.as_ref(), record);
        if !applied.wrote() {
            tx.commit().await?;
            return Ok(applied);
        }

        let (sql, values) = Query::insert()
            .into_table(Users::Table)
            .columns(COLUMNS)
            .values_panic([
                record.id.as_str().into(),
                record.email.as_str().into(),
                record.display_name.as_str().into(),
                format_timestamp(&record.created_at).into(),
                format_timestamp(&record.updated_at).into(),
                record.source_version.into(),
            ])
            .on_conflict(
                OnConflict::column(Users::Id)
                    .update_columns([
                        Users::Email,
                        Users::DisplayName,
                        Users::CreatedAt,
                        Users::UpdatedAt,
                        Users::SourceVersion,
                    ])
                    .action_and_where(
                        Expr::col((Users::Table, Users::SourceVersion))
                            .lte(Expr::col((Alias::new(EXCLUDED), Users::SourceVersion))),
                    )
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *tx).await?;

        tx.commit().await?;

        Ok(applied)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(Users::Table)
            .and_where(Expr::col(Users::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<UserRecord>> {
        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(Users::Table)
            .order_by(Users::CreatedAt, Order::Desc)
            .order_by(Users::Id, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_record).collect()
    }
}
