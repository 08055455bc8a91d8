//! Durable resume store.
//!
//! A SQLite-backed map from task id to [`TaskRecord`], managed by Diesel
//! with embedded migrations. Each `put` is a single `REPLACE` statement,
//! so a reader never observes a half-written record and a record that was
//! acknowledged survives a process crash. The engine writes each task id
//! from one place at a time; the store itself adds no per-id locking.

mod records;
mod schema;

pub use records::{TaskRecord, TaskState};

use anyhow::{Context, Result, anyhow};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use records::{NewTaskRecordRow, TaskRecordRow};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use schema::task_records::dsl as records_dsl;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/resume");

/// SQLite-backed store for in-flight task records.
pub struct ResumeStore {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl ResumeStore {
    /// Open the store at the default location (~/.upload-engine/resume.db)
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Unable to determine home directory"))?;
        Self::open(home.join(".upload-engine").join("resume.db"))
    }

    /// Open or create the store at a specific path. The schema is migrated
    /// to the latest version on open.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create resume store parent dir {}", parent.display())
            })?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid resume store path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build resume store connection pool")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from resume store pool")
    }

    /// Atomically insert or overwrite the record for its task id.
    pub fn put(&self, record: &TaskRecord) -> Result<()> {
        let mut conn = self.connection()?;
        let row = NewTaskRecordRow::from_record(record)?;
        diesel::replace_into(schema::task_records::table)
            .values(&row)
            .execute(&mut conn)
            .context("Failed to persist task record")?;
        debug!(
            target: "store",
            task_id = %record.task_id,
            status = record.status.as_str(),
            completed = record.completed_chunks.len(),
            "Persisted task record"
        );
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = records_dsl::task_records
            .filter(records_dsl::task_id.eq(task_id))
            .first::<TaskRecordRow>(&mut conn)
            .optional()
            .context("Failed to query task record")?;
        row.map(TaskRecord::try_from).transpose()
    }

    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected =
            diesel::delete(records_dsl::task_records.filter(records_dsl::task_id.eq(task_id)))
                .execute(&mut conn)
                .context("Failed to delete task record")?;
        Ok(affected > 0)
    }

    /// All persisted records, oldest first.
    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        let mut conn = self.connection()?;
        let rows = records_dsl::task_records
            .order(records_dsl::created_at.asc())
            .load::<TaskRecordRow>(&mut conn)
            .context("Failed to list task records")?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    /// Release the connection pool. Records stay on disk.
    pub fn close(self) {}
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .context("Failed to open resume store for migration")?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!("Failed to run resume store migrations: {e}"))?;
    Ok(())
}
