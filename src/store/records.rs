//! Persisted task records and their row mappings.

use super::schema::task_records;
use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Task lifecycle state.
///
/// `Hashing` and `Uploading` are not exclusive at runtime: the whole-file
/// digest runs alongside transfer, and the label reflects the dominant
/// phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Hashing,
    Uploading,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Hashing => "hashing",
            TaskState::Uploading => "uploading",
            TaskState::Paused => "paused",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskState::Idle),
            "hashing" => Some(TaskState::Hashing),
            "uploading" => Some(TaskState::Uploading),
            "paused" => Some(TaskState::Paused),
            "success" => Some(TaskState::Success),
            "error" => Some(TaskState::Error),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Error | TaskState::Cancelled
        )
    }
}

/// Everything needed to resume an interrupted upload. Holds indices,
/// hashes and the session token, never file bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    /// `name:size:last_modified` of the source, used only to reassociate a
    /// re-selected file with this record
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    /// Current nominal chunk size
    pub chunk_size: u64,
    pub upload_token: Option<String>,
    pub token_expires_at: Option<i64>,
    /// index -> content address, written only after the server acked the chunk
    pub completed_chunks: BTreeMap<usize, String>,
    pub whole_file_hash: Option<String>,
    pub status: TaskState,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        file_fingerprint: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            task_id: task_id.into(),
            file_fingerprint: file_fingerprint.into(),
            file_name: file_name.into(),
            file_size,
            chunk_size,
            upload_token: None,
            token_expires_at: None,
            completed_chunks: BTreeMap::new(),
            whole_file_hash: None,
            status: TaskState::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }
}

// =========================================================================
// Row Types
// =========================================================================

#[derive(Queryable)]
pub(crate) struct TaskRecordRow {
    pub task_id: String,
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub upload_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub completed_chunks: String,
    pub whole_file_hash: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = task_records)]
pub(crate) struct NewTaskRecordRow {
    task_id: String,
    file_fingerprint: String,
    file_name: String,
    file_size: i64,
    chunk_size: i64,
    upload_token: Option<String>,
    token_expires_at: Option<i64>,
    completed_chunks: String,
    whole_file_hash: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl NewTaskRecordRow {
    pub(crate) fn from_record(record: &TaskRecord) -> Result<Self> {
        let completed_json = serde_json::to_string(&record.completed_chunks)
            .context("Failed to serialize completed chunks")?;
        Ok(Self {
            task_id: record.task_id.clone(),
            file_fingerprint: record.file_fingerprint.clone(),
            file_name: record.file_name.clone(),
            file_size: record.file_size as i64,
            chunk_size: record.chunk_size as i64,
            upload_token: record.upload_token.clone(),
            token_expires_at: record.token_expires_at,
            completed_chunks: completed_json,
            whole_file_hash: record.whole_file_hash.clone(),
            status: record.status.as_str().to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl TryFrom<TaskRecordRow> for TaskRecord {
    type Error = anyhow::Error;

    fn try_from(row: TaskRecordRow) -> Result<Self> {
        let completed_chunks: BTreeMap<usize, String> =
            serde_json::from_str(&row.completed_chunks)
                .context("Failed to deserialize completed chunks")?;
        let status = TaskState::from_str(&row.status)
            .with_context(|| format!("Unknown task status {}", row.status))?;

        Ok(Self {
            task_id: row.task_id,
            file_fingerprint: row.file_fingerprint,
            file_name: row.file_name,
            file_size: row.file_size as u64,
            chunk_size: row.chunk_size as u64,
            upload_token: row.upload_token,
            token_expires_at: row.token_expires_at,
            completed_chunks,
            whole_file_hash: row.whole_file_hash,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
