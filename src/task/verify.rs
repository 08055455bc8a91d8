//! Batched dedup probes.
//!
//! Chunks that finished hashing within a short window are verified against
//! the server in one call, trading a tiny latency for far fewer requests.
//! A probe answers "does the server already store this content address";
//! a negative answer (including any verify failure) just means the chunk
//! is transferred normally.

use crate::adapter::{RequestAdapter, SessionCredential, VerifyRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Probe {
    index: usize,
    hash: String,
    reply: oneshot::Sender<bool>,
}

pub(crate) struct VerifyBatcher {
    probe_tx: mpsc::UnboundedSender<Probe>,
}

impl VerifyBatcher {
    pub fn spawn(
        adapter: Arc<dyn RequestAdapter>,
        session: Arc<RwLock<Option<SessionCredential>>>,
        window: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel::<Probe>();

        tokio::spawn(async move {
            'outer: loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    probe = probe_rx.recv() => match probe {
                        Some(probe) => probe,
                        None => break,
                    },
                };

                let mut batch = vec![first];
                let deadline = tokio::time::sleep(window);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        _ = cancel.cancelled() => break 'outer,
                        probe = probe_rx.recv() => match probe {
                            Some(probe) => batch.push(probe),
                            None => break,
                        },
                    }
                }

                let token = session
                    .read()
                    .await
                    .as_ref()
                    .map(|s| s.upload_token.clone())
                    .unwrap_or_default();
                let request = VerifyRequest {
                    upload_token: token,
                    file_hash: None,
                    chunk_hashes: batch.iter().map(|p| p.hash.clone()).collect(),
                };

                debug!(
                    target: "task::chunk",
                    probes = batch.len(),
                    chunks = ?batch.iter().map(|p| p.index).collect::<Vec<_>>(),
                    "Sending batched dedup probe"
                );

                match adapter.verify_hash(request).await {
                    Ok(response) => {
                        let existing: HashSet<usize> =
                            response.existing_chunks.into_iter().collect();
                        for (position, probe) in batch.into_iter().enumerate() {
                            let _ = probe.reply.send(existing.contains(&position));
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "task::chunk",
                            error = %err,
                            "Dedup probe failed, treating chunks as missing"
                        );
                        for probe in batch {
                            let _ = probe.reply.send(false);
                        }
                    }
                }
            }
        });

        Self { probe_tx }
    }

    /// True if the server already stores this content address.
    pub async fn probe(&self, index: usize, hash: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .probe_tx
            .send(Probe { index, hash, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use std::sync::atomic::Ordering;

    fn session_with_token() -> Arc<RwLock<Option<SessionCredential>>> {
        Arc::new(RwLock::new(Some(SessionCredential {
            upload_token: "tok".into(),
            negotiated_chunk_size: 1024,
            expires_at: i64::MAX,
        })))
    }

    #[tokio::test]
    async fn probes_within_the_window_share_one_call() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.seed_chunks([b"known".as_slice()]);
        let known_hash = crate::hasher::digest(b"known");

        let batcher = VerifyBatcher::spawn(
            adapter.clone(),
            session_with_token(),
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        let (first, second) = tokio::join!(
            batcher.probe(0, known_hash),
            batcher.probe(1, "absent".to_string()),
        );
        assert!(first);
        assert!(!second);
        assert_eq!(adapter.verify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.verify_batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn separate_windows_produce_separate_calls() {
        let adapter = Arc::new(MockAdapter::new());
        let batcher = VerifyBatcher::spawn(
            adapter.clone(),
            session_with_token(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        assert!(!batcher.probe(0, "a".into()).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!batcher.probe(1, "b".into()).await);
        assert_eq!(adapter.verify_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_batcher_answers_missing() {
        let adapter = Arc::new(MockAdapter::new());
        let cancel = CancellationToken::new();
        let batcher = VerifyBatcher::spawn(
            adapter,
            session_with_token(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!batcher.probe(0, "a".into()).await);
    }
}
