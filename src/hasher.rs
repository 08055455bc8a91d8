//! Content digests for chunks and whole files.
//!
//! The digest is xxh3-128: fast, non-cryptographic, deterministic across
//! runs and platforms. It is a content address for deduplication, not a
//! tamper check, and must match the digest the server computes over the
//! same bytes.

use crate::error::{UploadError, UploadResult};
use crate::source::FileSource;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use xxhash_rust::xxh3::{Xxh3, xxh3_128};

/// Bytes hashed per scheduling step when digesting a whole source (4MB)
const DEFAULT_READ_STEP: u64 = 4 * 1024 * 1024;

/// Minimum interval between progress reports (at most 5 per second)
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Digest a byte slice to a 32-char lowercase hex content address.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:032x}", xxh3_128(bytes))
}

/// Synchronous digest kept for benchmark comparison against the
/// worker-offloaded path. Do not call this from upload paths; it blocks
/// the calling thread for the full input.
pub fn digest_blocking(bytes: &[u8]) -> String {
    digest(bytes)
}

/// Runs digests off the async runtime so hashing large inputs never stalls
/// the executor.
#[derive(Debug, Clone)]
pub struct HashWorker {
    read_step: u64,
}

impl Default for HashWorker {
    fn default() -> Self {
        Self {
            read_step: DEFAULT_READ_STEP,
        }
    }
}

impl HashWorker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_read_step(read_step: u64) -> Self {
        Self {
            read_step: read_step.max(1),
        }
    }

    /// Digest an in-memory buffer on a blocking worker thread.
    pub async fn digest_bytes(&self, bytes: Bytes) -> UploadResult<String> {
        tokio::task::spawn_blocking(move || digest(&bytes))
            .await
            .map_err(|e| UploadError::Other(format!("hash worker died: {e}")))
    }

    /// Digest an entire source, reading it in steps so the hashing loop
    /// yields regularly.
    ///
    /// `on_progress` receives a monotonic 0-100 percentage, throttled to at
    /// most five reports per second; 100 is always reported on completion.
    pub async fn digest_source(
        &self,
        source: &dyn FileSource,
        cancel: &CancellationToken,
        on_progress: impl Fn(u8),
    ) -> UploadResult<String> {
        let size = source.size();
        let mut state = Xxh3::new();
        let mut offset = 0u64;
        let mut last_report = Instant::now();
        let mut last_percent = 0u8;

        while offset < size {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let end = (offset + self.read_step).min(size);
            let buf = source.read_range(offset, end).await?;
            state = tokio::task::spawn_blocking(move || {
                let mut state = state;
                state.update(&buf);
                state
            })
            .await
            .map_err(|e| UploadError::Other(format!("hash worker died: {e}")))?;
            offset = end;

            let percent = ((offset * 100) / size) as u8;
            let done = offset == size;
            if percent > last_percent && (done || last_report.elapsed() >= PROGRESS_INTERVAL) {
                last_percent = percent;
                last_report = Instant::now();
                trace!(target: "hasher", percent, "Digest progress");
                on_progress(percent);
            }
        }

        if last_percent < 100 {
            on_progress(100);
        }
        Ok(format!("{:032x}", state.digest128()))
    }
}
