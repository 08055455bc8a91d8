//! The transport contract consumed by the engine.
//!
//! The engine never embeds a transport. Hosts supply an implementation of
//! [`RequestAdapter`] (HTTP, WebSocket, anything) at construction time and
//! the engine interprets its typed results.

use crate::error::UploadError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Result type for adapter operations. Adapters classify their own
/// transport failures with the shared [`UploadError`] taxonomy.
pub type AdapterResult<T> = Result<T, UploadError>;

/// Session creation request
#[derive(Debug, Clone)]
pub struct CreateFileRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    /// Chunk size the client would like; the server may shrink it
    pub preferred_chunk_size: Option<u64>,
}

/// Server-issued upload session.
///
/// The token is opaque; only `expires_at` is interpreted, to short-circuit
/// obviously dead sessions before a request is wasted on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    pub upload_token: String,
    /// Nominal chunk size chosen by the server; the engine must honor it
    pub negotiated_chunk_size: u64,
    /// Expiration, unix seconds
    pub expires_at: i64,
}

impl SessionCredential {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Content-address lookup request. Either a whole-file hash (instant
/// upload probe) or an ordered list of chunk hashes (dedup probe).
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub upload_token: String,
    pub file_hash: Option<String>,
    pub chunk_hashes: Vec<String>,
}

/// Response to [`VerifyRequest`]. `existing_chunks` and `missing_chunks`
/// are positions into the submitted `chunk_hashes` array and partition it.
#[derive(Debug, Clone, Default)]
pub struct VerifyResponse {
    pub file_exists: bool,
    pub file_url: Option<String>,
    pub existing_chunks: Vec<usize>,
    pub missing_chunks: Vec<usize>,
}

/// One chunk transfer
#[derive(Debug, Clone)]
pub struct UploadChunkRequest {
    pub upload_token: String,
    pub chunk_index: usize,
    pub chunk_hash: String,
    pub bytes: Bytes,
}

/// Acknowledgement that the server durably stored the chunk's bytes under
/// `chunk_hash` and associated them with this file at the chunk's index.
#[derive(Debug, Clone)]
pub struct UploadChunkResponse {
    pub chunk_hash: String,
}

/// Logical merge request: the ordered chunk hashes plus the whole-file
/// hash finalize the upload server-side.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub upload_token: String,
    pub file_hash: String,
    pub chunk_hashes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergeResponse {
    pub file_url: String,
    pub file_id: String,
}

/// The four operations the engine calls.
///
/// Adapters are stateless from the engine's point of view and must accept
/// concurrent callers.
#[async_trait]
pub trait RequestAdapter: Send + Sync {
    /// Create a server-side upload session
    async fn create_file(&self, req: CreateFileRequest) -> AdapterResult<SessionCredential>;

    /// Probe the server's content-addressed store
    async fn verify_hash(&self, req: VerifyRequest) -> AdapterResult<VerifyResponse>;

    /// Transfer one chunk
    async fn upload_chunk(&self, req: UploadChunkRequest) -> AdapterResult<UploadChunkResponse>;

    /// Finalize the upload
    async fn merge_file(&self, req: MergeRequest) -> AdapterResult<MergeResponse>;
}
