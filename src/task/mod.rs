//! Upload task: the per-file state machine and chunk pipeline.
//!
//! A task owns its chunk plan, its in-flight chunk jobs, its progress and
//! its resume record. The pipeline overlaps the whole-file digest with
//! chunk transfer: hashing feeds the final merge, never chunk dispatch.

mod progress;
mod verify;

pub use progress::ProgressSnapshot;

use crate::adapter::{
    CreateFileRequest, MergeRequest, RequestAdapter, SessionCredential, UploadChunkRequest,
    VerifyRequest,
};
use crate::config::{EngineConfig, TaskOptions, TaskSettings};
use crate::error::{UploadError, UploadResult};
use crate::events::{EventBus, ListenerId, TaskEvent};
use crate::hasher::HashWorker;
use crate::limiter::Limiter;
use crate::plan::{self, ChunkSpec};
use crate::sizer::ChunkSizer;
use crate::source::FileSource;
use crate::store::{ResumeStore, TaskRecord, TaskState};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use progress::ProgressTracker;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use verify::VerifyBatcher;

/// Backoff growth is capped at this delay
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum HashState {
    Pending,
    Done(String),
    Failed(UploadError),
}

enum PipelineOutcome {
    Complete { file_url: String },
    Paused,
}

enum DispatchOutcome {
    Finished,
    Paused,
}

struct ChunkAck {
    hash: String,
    /// False when the server already had the content (dedup hit)
    uploaded: bool,
    /// Wall time of the successful transfer attempt; None for dedup hits
    elapsed: Option<Duration>,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask").field("id", &self.id).finish()
    }
}

/// A single file upload with pause/resume/cancel, retries and resumability.
pub struct UploadTask {
    id: String,
    source: Arc<dyn FileSource>,
    adapter: Arc<dyn RequestAdapter>,
    store: Arc<ResumeStore>,
    settings: TaskSettings,
    events: EventBus<TaskEvent>,

    state: RwLock<TaskState>,
    /// Held across every state change and its event emission so any single
    /// listener observes transitions in order
    transition_lock: Mutex<()>,

    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,

    chunk_limiter: Arc<Limiter>,
    task_gate: Option<Arc<Limiter>>,
    hash_worker: Arc<HashWorker>,

    session: Arc<tokio::sync::RwLock<Option<SessionCredential>>>,
    plan: Mutex<Vec<ChunkSpec>>,
    /// First plan index not yet dispatched; dispatch is index-ascending
    cursor: AtomicUsize,
    sizer: Mutex<ChunkSizer>,
    completed: DashMap<usize, String>,
    inflight: DashMap<usize, ()>,
    progress: ProgressTracker,
    record: Mutex<TaskRecord>,
    batcher: OnceLock<VerifyBatcher>,

    hash_tx: watch::Sender<HashState>,
    hash_started: AtomicBool,

    /// Serializes ack bookkeeping so chunk events stay ordered
    ack_lock: Mutex<()>,
    /// Error raised by a chunk job while no driver was watching
    fatal: Mutex<Option<UploadError>>,
    settle_notify: Notify,
    driver_running: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful token refresh
    session_epoch: std::sync::atomic::AtomicU64,
    restored: bool,
    reverified: AtomicBool,
}

impl UploadTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: Arc<dyn FileSource>,
        adapter: Arc<dyn RequestAdapter>,
        store: Arc<ResumeStore>,
        config: &EngineConfig,
        options: &TaskOptions,
        record: TaskRecord,
        restored: bool,
        task_gate: Option<Arc<Limiter>>,
        hash_worker: Arc<HashWorker>,
    ) -> Arc<Self> {
        let settings = TaskSettings::resolve(config, options);
        let initial_state = if restored { TaskState::Paused } else { TaskState::Idle };

        let whole_hash = options
            .precomputed_file_hash
            .clone()
            .or_else(|| record.whole_file_hash.clone());
        let hash_state = match whole_hash {
            Some(hash) => HashState::Done(hash),
            None => HashState::Pending,
        };

        let completed = DashMap::new();
        for (index, hash) in &record.completed_chunks {
            completed.insert(*index, hash.clone());
        }

        let progress = ProgressTracker::new(source.size());
        let sizer = ChunkSizer::new(
            if restored && record.chunk_size > 0 {
                record.chunk_size
            } else {
                settings.preferred_chunk_size
            },
            settings.min_chunk_size,
            settings.max_chunk_size,
            settings.target_upload_ms,
        );

        Arc::new(Self {
            id: record.task_id.clone(),
            source,
            adapter,
            store,
            settings: settings.clone(),
            events: EventBus::new(),
            state: RwLock::new(initial_state),
            transition_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            pause_tx: watch::channel(false).0,
            chunk_limiter: Limiter::new(settings.concurrency),
            task_gate,
            hash_worker,
            session: Arc::new(tokio::sync::RwLock::new(None)),
            plan: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            sizer: Mutex::new(sizer),
            completed,
            inflight: DashMap::new(),
            progress,
            record: Mutex::new(record),
            batcher: OnceLock::new(),
            hash_tx: watch::channel(hash_state).0,
            hash_started: AtomicBool::new(false),
            ack_lock: Mutex::new(()),
            fatal: Mutex::new(None),
            settle_notify: Notify::new(),
            driver_running: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
            session_epoch: std::sync::atomic::AtomicU64::new(0),
            restored,
            reverified: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.read().expect("task state poisoned")
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Register a listener for this task's events
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Begin uploading. Idempotent while `idle`; a no-op in any other state.
    pub fn start(self: &Arc<Self>) {
        {
            let _guard = self.transition_lock.lock().expect("transition poisoned");
            {
                let mut state = self.state.write().expect("task state poisoned");
                if *state != TaskState::Idle {
                    return;
                }
                *state = TaskState::Hashing;
            }
            self.update_record_status(TaskState::Hashing);
            info!(target: "task", task_id = %self.id, "Task started");
            self.events.emit(&TaskEvent::Started {
                task_id: self.id.clone(),
            });
        }
        self.spawn_driver();
    }

    /// Stop dispatching new chunk jobs. In-flight jobs run to completion
    /// and their acks are still recorded.
    pub fn pause(&self) {
        let _guard = self.transition_lock.lock().expect("transition poisoned");
        {
            let mut state = self.state.write().expect("task state poisoned");
            if !matches!(*state, TaskState::Uploading | TaskState::Hashing) {
                return;
            }
            *state = TaskState::Paused;
        }
        let _ = self.pause_tx.send(true);
        self.update_record_status(TaskState::Paused);
        self.persist_record();
        info!(target: "task", task_id = %self.id, "Task paused");
        self.events.emit(&TaskEvent::Paused {
            task_id: self.id.clone(),
        });
    }

    /// Re-enter dispatch from `paused`, or from a restored record.
    pub fn resume(self: &Arc<Self>) {
        {
            let _guard = self.transition_lock.lock().expect("transition poisoned");
            {
                let mut state = self.state.write().expect("task state poisoned");
                if *state != TaskState::Paused {
                    return;
                }
                *state = TaskState::Uploading;
            }
            let _ = self.pause_tx.send(false);
            self.update_record_status(TaskState::Uploading);
            info!(target: "task", task_id = %self.id, "Task resumed");
            self.events.emit(&TaskEvent::Resumed {
                task_id: self.id.clone(),
            });
        }
        self.spawn_driver();
    }

    /// Abandon the upload. Legal from any non-terminal state; deletes the
    /// resume record and aborts in-flight calls promptly.
    pub fn cancel(&self) {
        {
            let _guard = self.transition_lock.lock().expect("transition poisoned");
            {
                let mut state = self.state.write().expect("task state poisoned");
                if state.is_terminal() {
                    return;
                }
                *state = TaskState::Cancelled;
            }
            info!(target: "task", task_id = %self.id, "Task cancelled");
            self.events.emit(&TaskEvent::Cancelled {
                task_id: self.id.clone(),
            });
        }
        self.cancel.cancel();
        let _ = self.pause_tx.send(false);
        // Serialize with ack bookkeeping so a late ack cannot resurrect
        // the record after this delete
        let _acks = self.ack_lock.lock().expect("ack lock poisoned");
        if let Err(err) = self.store.delete(&self.id) {
            warn!(target: "task", task_id = %self.id, error = %err, "Failed to delete resume record");
        }
    }

    // ---------------------------------------------------------------------
    // Driver
    // ---------------------------------------------------------------------

    fn spawn_driver(self: &Arc<Self>) {
        if self.driver_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = Arc::clone(self);
        let fut = async move { task.drive().await };
        match &self.task_gate {
            Some(gate) => drop(gate.submit(fut)),
            None => drop(tokio::spawn(fut)),
        }
    }

    async fn drive(self: Arc<Self>) {
        let outcome = self.run_pipeline().await;
        self.driver_running.store(false, Ordering::SeqCst);
        match outcome {
            Ok(PipelineOutcome::Complete { file_url }) => self.finish_success(file_url),
            Ok(PipelineOutcome::Paused) => {
                // A resume may have slipped in while this driver was
                // tearing down; it found driver_running still true.
                if self.state() == TaskState::Uploading {
                    self.spawn_driver();
                }
            }
            Err(err) if err.is_cancelled() || self.cancel.is_cancelled() => {}
            Err(err) => self.finish_error(err),
        }
    }

    async fn run_pipeline(self: &Arc<Self>) -> UploadResult<PipelineOutcome> {
        self.ensure_session().await?;
        self.reconcile_with_server().await?;

        if let Some(hash) = self.known_whole_hash() {
            if self.completed.is_empty() {
                if let Some(file_url) = self.try_instant_upload(&hash).await {
                    return Ok(PipelineOutcome::Complete { file_url });
                }
            }
        }

        self.spawn_hash_job();

        if let DispatchOutcome::Paused = self.dispatch_chunks().await? {
            return Ok(PipelineOutcome::Paused);
        }

        let whole_hash = self.wait_whole_hash().await?;
        let file_url = self.merge(&whole_hash).await?;
        Ok(PipelineOutcome::Complete { file_url })
    }

    // ---------------------------------------------------------------------
    // Session
    // ---------------------------------------------------------------------

    async fn ensure_session(self: &Arc<Self>) -> UploadResult<()> {
        if self.session.read().await.is_some() {
            return Ok(());
        }

        let stored = {
            let record = self.record.lock().expect("record poisoned");
            match (&record.upload_token, record.token_expires_at) {
                (Some(token), Some(expires)) => Some(SessionCredential {
                    upload_token: token.clone(),
                    negotiated_chunk_size: record.chunk_size,
                    expires_at: expires,
                }),
                _ => None,
            }
        };

        let credential = match stored {
            Some(credential) if !credential.is_expired() => credential,
            _ => {
                let request = CreateFileRequest {
                    file_name: self.source.name().to_string(),
                    file_size: self.source.size(),
                    mime_type: self.source.mime_type().map(str::to_string),
                    preferred_chunk_size: Some(self.settings.preferred_chunk_size),
                };
                let adapter = Arc::clone(&self.adapter);
                self.call_with_retry(move || {
                    let adapter = Arc::clone(&adapter);
                    let request = request.clone();
                    async move { adapter.create_file(request).await }
                })
                .await?
            }
        };

        if credential.negotiated_chunk_size == 0 {
            return Err(UploadError::ContractViolation(
                "negotiated chunk size must be a positive integer".into(),
            ));
        }

        let initial = credential
            .negotiated_chunk_size
            .clamp(self.settings.min_chunk_size, self.settings.max_chunk_size);
        self.sizer.lock().expect("sizer poisoned").set_current(initial);

        let chunk_count = {
            let mut plan = self.plan.lock().expect("plan poisoned");
            *plan = plan::build_plan(self.source.size(), initial);
            // Restored records may carry entries past the rebuilt plan
            self.completed.retain(|index, _| *index < plan.len());
            plan.len()
        };
        self.progress.set_total_chunks(chunk_count);
        self.reseed_progress();

        {
            let mut record = self.record.lock().expect("record poisoned");
            record.upload_token = Some(credential.upload_token.clone());
            record.token_expires_at = Some(credential.expires_at);
            record.chunk_size = initial;
            record
                .completed_chunks
                .retain(|index, _| self.completed.contains_key(index));
            record.touch();
        }
        self.persist_record();

        *self.session.write().await = Some(credential);

        self.batcher.get_or_init(|| {
            VerifyBatcher::spawn(
                Arc::clone(&self.adapter),
                Arc::clone(&self.session),
                self.settings.verify_batch_window,
                self.cancel.clone(),
            )
        });

        debug!(
            target: "task",
            task_id = %self.id,
            chunk_size = initial,
            chunks = chunk_count,
            "Upload session ready"
        );
        Ok(())
    }

    /// One automatic token refresh, shared by concurrent callers: whoever
    /// saw the expiry first refreshes, everyone who queued behind it reuses
    /// the new token.
    async fn refresh_session(&self, observed_epoch: u64) -> UploadResult<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.session_epoch.load(Ordering::SeqCst) != observed_epoch {
            return Ok(());
        }

        let preferred = self.sizer.lock().expect("sizer poisoned").current();
        let request = CreateFileRequest {
            file_name: self.source.name().to_string(),
            file_size: self.source.size(),
            mime_type: self.source.mime_type().map(str::to_string),
            preferred_chunk_size: Some(preferred),
        };
        let credential = self
            .timed(self.adapter.create_file(request))
            .await
            .map_err(|err| UploadError::SessionCreationFailed(err.to_string()))?;

        if credential.negotiated_chunk_size == 0 {
            return Err(UploadError::ContractViolation(
                "negotiated chunk size must be a positive integer".into(),
            ));
        }

        let size = credential
            .negotiated_chunk_size
            .clamp(self.settings.min_chunk_size, self.settings.max_chunk_size);
        // The next not-yet-started chunk picks this up and replans the
        // uncommitted suffix if the size changed.
        self.sizer.lock().expect("sizer poisoned").set_current(size);

        {
            let mut record = self.record.lock().expect("record poisoned");
            record.upload_token = Some(credential.upload_token.clone());
            record.token_expires_at = Some(credential.expires_at);
            record.touch();
        }
        self.persist_record();
        *self.session.write().await = Some(credential);
        self.session_epoch.fetch_add(1, Ordering::SeqCst);
        info!(target: "task", task_id = %self.id, "Upload token refreshed");
        Ok(())
    }

    /// On restored sessions, reconcile the completed set with server truth
    /// before dispatching anything.
    async fn reconcile_with_server(self: &Arc<Self>) -> UploadResult<()> {
        if !self.restored || self.reverified.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut entries: Vec<(usize, String)> = self
            .completed
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(index, _)| *index);

        if !entries.is_empty() {
            let token = self.current_token().await;
            let hashes: Vec<String> = entries.iter().map(|(_, h)| h.clone()).collect();
            let adapter = Arc::clone(&self.adapter);
            let response = self
                .call_with_retry(move || {
                    let adapter = Arc::clone(&adapter);
                    let request = VerifyRequest {
                        upload_token: token.clone(),
                        file_hash: None,
                        chunk_hashes: hashes.clone(),
                    };
                    async move { adapter.verify_hash(request).await }
                })
                .await?;

            let existing: HashSet<usize> = response.existing_chunks.into_iter().collect();
            let mut dropped = 0usize;
            for (position, (index, _)) in entries.iter().enumerate() {
                if !existing.contains(&position) {
                    self.completed.remove(index);
                    dropped += 1;
                }
            }
            if dropped > 0 {
                let mut record = self.record.lock().expect("record poisoned");
                record
                    .completed_chunks
                    .retain(|index, _| self.completed.contains_key(index));
                record.touch();
                drop(record);
                self.persist_record();
                info!(
                    target: "task",
                    task_id = %self.id,
                    dropped,
                    "Server no longer stores some chunks, re-uploading them"
                );
            }
            self.reseed_progress();
        }

        self.reverified.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// One-shot whole-file probe. Purely an optimization: failures fall
    /// through to the normal chunk path.
    async fn try_instant_upload(&self, whole_hash: &str) -> Option<String> {
        let request = VerifyRequest {
            upload_token: self.current_token().await,
            file_hash: Some(whole_hash.to_string()),
            chunk_hashes: Vec::new(),
        };
        match self.timed(self.adapter.verify_hash(request)).await {
            Ok(response) if response.file_exists => {
                info!(target: "task", task_id = %self.id, "Instant upload hit");
                let chunks = self.plan.lock().expect("plan poisoned").len();
                self.progress.seed(self.source.size(), chunks);
                self.events.emit(&TaskEvent::Progress {
                    task_id: self.id.clone(),
                    progress: self.progress.snapshot(),
                });
                Some(response.file_url.unwrap_or_default())
            }
            Ok(_) => None,
            Err(err) => {
                debug!(target: "task", task_id = %self.id, error = %err, "Instant upload probe failed");
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Whole-file digest
    // ---------------------------------------------------------------------

    fn spawn_hash_job(self: &Arc<Self>) {
        if !matches!(&*self.hash_tx.borrow(), HashState::Pending) {
            return;
        }
        if self.hash_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = Arc::clone(self);
        tokio::spawn(async move {
            let result = task
                .hash_worker
                .digest_source(task.source.as_ref(), &task.cancel, |percent| {
                    task.events.emit(&TaskEvent::HashProgress {
                        task_id: task.id.clone(),
                        percent,
                    });
                })
                .await;

            match result {
                Ok(hash) => {
                    {
                        let mut record = task.record.lock().expect("record poisoned");
                        record.whole_file_hash = Some(hash.clone());
                        record.touch();
                    }
                    task.persist_record();
                    debug!(target: "hasher", task_id = %task.id, "Whole-file digest complete");
                    task.events.emit(&TaskEvent::HashComplete {
                        task_id: task.id.clone(),
                        hash: hash.clone(),
                    });
                    let _ = task.hash_tx.send(HashState::Done(hash));
                }
                Err(err) => {
                    let _ = task.hash_tx.send(HashState::Failed(err));
                }
            }
        });
    }

    fn known_whole_hash(&self) -> Option<String> {
        match &*self.hash_tx.borrow() {
            HashState::Done(hash) => Some(hash.clone()),
            _ => None,
        }
    }

    async fn wait_whole_hash(&self) -> UploadResult<String> {
        let mut rx = self.hash_tx.subscribe();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            match snapshot {
                HashState::Done(hash) => return Ok(hash),
                HashState::Failed(err) => return Err(err),
                HashState::Pending => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(UploadError::Other("whole-file hash job abandoned".into()));
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Chunk dispatch
    // ---------------------------------------------------------------------

    async fn dispatch_chunks(self: &Arc<Self>) -> UploadResult<DispatchOutcome> {
        self.mark_uploading();

        let mut slots = FuturesUnordered::new();
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if let Some(err) = self.fatal.lock().expect("fatal poisoned").take() {
                return Err(err);
            }
            if self.is_paused() {
                // In-flight jobs keep running and record their own acks
                return Ok(DispatchOutcome::Paused);
            }

            while slots.len() < self.settings.concurrency {
                match self.next_chunk() {
                    Some(spec) => {
                        self.inflight.insert(spec.index, ());
                        let task = Arc::clone(self);
                        slots.push(
                            self.chunk_limiter
                                .submit(async move { task.run_chunk(spec).await }),
                        );
                    }
                    None => break,
                }
            }

            if slots.is_empty() {
                if self.all_chunks_acked() {
                    return Ok(DispatchOutcome::Finished);
                }
                if self.inflight.is_empty() {
                    return Err(UploadError::PlanInconsistency(
                        "plan exhausted with unacknowledged chunks".into(),
                    ));
                }
                // Jobs spawned by a previous driver are still settling
                self.wait_for_settle().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = self.pause_changed() => continue,
                settled = slots.next() => match settled {
                    Some(Some(Ok(()))) => {}
                    Some(Some(Err(err))) => return Err(err),
                    Some(None) => return Err(UploadError::Other("chunk job was dropped".into())),
                    None => {}
                },
            }
        }
    }

    /// Pick the next not-yet-started descriptor, replanning the uncommitted
    /// suffix first when the nominal size moved.
    fn next_chunk(&self) -> Option<ChunkSpec> {
        let mut plan = self.plan.lock().expect("plan poisoned");
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            if cursor >= plan.len() {
                return None;
            }
            if self.completed.contains_key(&cursor) {
                self.cursor.store(cursor + 1, Ordering::SeqCst);
                continue;
            }

            let file_size = plan.last().map(|c| c.end).unwrap_or(0);
            let nominal = self.sizer.lock().expect("sizer poisoned").current();
            let remaining = file_size - plan[cursor].start;
            let expected = nominal.min(remaining);
            // Committed boundaries are immutable: only replan while every
            // acked or running chunk sits before the cursor.
            let suffix_untouched = !self.completed.iter().any(|e| *e.key() >= cursor)
                && !self.inflight.iter().any(|e| *e.key() >= cursor);
            if plan[cursor].size != expected && suffix_untouched {
                plan::replan_suffix(&mut plan, cursor, nominal);
                self.progress.set_total_chunks(plan.len());
                debug!(
                    target: "task::chunk",
                    task_id = %self.id,
                    from_index = cursor,
                    chunk_size = nominal,
                    chunks = plan.len(),
                    "Replanned uncommitted suffix"
                );
            }

            let spec = plan[cursor].clone();
            self.cursor.store(cursor + 1, Ordering::SeqCst);
            return Some(spec);
        }
    }

    async fn run_chunk(self: Arc<Self>, spec: ChunkSpec) -> UploadResult<()> {
        let result = self.chunk_transfer(&spec).await;
        self.inflight.remove(&spec.index);
        let outcome = match result {
            Ok(ack) => {
                self.record_ack(&spec, ack);
                Ok(())
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                self.fail_task(err.clone());
                Err(err)
            }
        };
        self.settle_notify.notify_waiters();
        outcome
    }

    async fn chunk_transfer(&self, spec: &ChunkSpec) -> UploadResult<ChunkAck> {
        self.wait_while_paused().await?;

        // Lazy slice: bytes are only materialized here
        let bytes = self.source.read_range(spec.start, spec.end).await?;
        let hash = self.hash_worker.digest_bytes(bytes.clone()).await?;

        if let Some(batcher) = self.batcher.get() {
            if batcher.probe(spec.index, hash.clone()).await {
                debug!(
                    target: "task::chunk",
                    task_id = %self.id,
                    chunk = spec.index,
                    "Server already stores this chunk, skipping transfer"
                );
                return Ok(ChunkAck {
                    hash,
                    uploaded: false,
                    elapsed: None,
                });
            }
        }

        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            self.wait_while_paused().await?;
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let epoch = self.session_epoch.load(Ordering::SeqCst);
            let request = UploadChunkRequest {
                upload_token: self.current_token().await,
                chunk_index: spec.index,
                chunk_hash: hash.clone(),
                bytes: bytes.clone(),
            };
            let started = Instant::now();
            match self.timed(self.adapter.upload_chunk(request)).await {
                Ok(response) => {
                    if response.chunk_hash != hash {
                        return Err(UploadError::ContractViolation(format!(
                            "server acked chunk {} with a different hash",
                            spec.index
                        )));
                    }
                    return Ok(ChunkAck {
                        hash,
                        uploaded: true,
                        elapsed: Some(started.elapsed()),
                    });
                }
                Err(UploadError::TokenExpired) if !refreshed => {
                    refreshed = true;
                    self.refresh_session(epoch).await?;
                }
                Err(err) if err.is_fatal() || err.is_cancelled() => return Err(err),
                Err(err) if err.is_retryable() => {
                    warn!(
                        target: "task::chunk",
                        task_id = %self.id,
                        chunk = spec.index,
                        attempt,
                        error = %err,
                        "Chunk upload failed"
                    );
                    self.events.emit(&TaskEvent::ChunkError {
                        task_id: self.id.clone(),
                        index: spec.index,
                        attempt,
                        message: err.to_string(),
                    });
                    if attempt >= self.settings.retry_count {
                        return Err(UploadError::chunk_failed(
                            spec.index,
                            format!("retries exhausted: {err}"),
                        ));
                    }
                    attempt += 1;
                    self.backoff(attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record_ack(&self, spec: &ChunkSpec, ack: ChunkAck) {
        let _guard = self.ack_lock.lock().expect("ack lock poisoned");
        // A terminal task discards late acks
        if self.state().is_terminal() {
            return;
        }
        // Idempotent by index: a duplicate ack never double-counts
        if self.completed.insert(spec.index, ack.hash.clone()).is_some() {
            return;
        }
        self.progress.record_ack(spec.size);
        if let Some(elapsed) = ack.elapsed {
            self.sizer.lock().expect("sizer poisoned").observe(elapsed);
        }

        {
            let mut record = self.record.lock().expect("record poisoned");
            record.completed_chunks.insert(spec.index, ack.hash.clone());
            record.chunk_size = self.sizer.lock().expect("sizer poisoned").current();
            record.touch();
        }
        self.persist_record();

        debug!(
            target: "task::chunk",
            task_id = %self.id,
            chunk = spec.index,
            uploaded = ack.uploaded,
            "Chunk acknowledged"
        );
        self.events.emit(&TaskEvent::ChunkSuccess {
            task_id: self.id.clone(),
            index: spec.index,
            hash: ack.hash,
        });
        self.events.emit(&TaskEvent::Progress {
            task_id: self.id.clone(),
            progress: self.progress.snapshot(),
        });
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    async fn merge(&self, whole_hash: &str) -> UploadResult<String> {
        let chunk_hashes: Vec<String> = {
            let plan = self.plan.lock().expect("plan poisoned");
            let mut hashes = Vec::with_capacity(plan.len());
            for index in 0..plan.len() {
                match self.completed.get(&index) {
                    Some(hash) => hashes.push(hash.clone()),
                    None => {
                        return Err(UploadError::PlanInconsistency(format!(
                            "chunk {index} missing at merge time"
                        )));
                    }
                }
            }
            hashes
        };

        let token = self.current_token().await;
        let adapter = Arc::clone(&self.adapter);
        let whole_hash = whole_hash.to_string();
        let response = self
            .call_with_retry(move || {
                let adapter = Arc::clone(&adapter);
                let request = MergeRequest {
                    upload_token: token.clone(),
                    file_hash: whole_hash.clone(),
                    chunk_hashes: chunk_hashes.clone(),
                };
                async move { adapter.merge_file(request).await }
            })
            .await?;

        Ok(response.file_url)
    }

    fn finish_success(&self, file_url: String) {
        {
            let _guard = self.transition_lock.lock().expect("transition poisoned");
            {
                let mut state = self.state.write().expect("task state poisoned");
                if state.is_terminal() {
                    return;
                }
                *state = TaskState::Success;
            }
            info!(target: "task", task_id = %self.id, file_url = %file_url, "Upload complete");
            self.events.emit(&TaskEvent::Progress {
                task_id: self.id.clone(),
                progress: self.progress.snapshot(),
            });
            self.events.emit(&TaskEvent::Success {
                task_id: self.id.clone(),
                file_url,
            });
        }
        let _acks = self.ack_lock.lock().expect("ack lock poisoned");
        if let Err(err) = self.store.delete(&self.id) {
            warn!(target: "task", task_id = %self.id, error = %err, "Failed to delete resume record");
        }
    }

    fn finish_error(&self, err: UploadError) {
        {
            let _guard = self.transition_lock.lock().expect("transition poisoned");
            {
                let mut state = self.state.write().expect("task state poisoned");
                if state.is_terminal() {
                    return;
                }
                *state = TaskState::Error;
            }
            warn!(target: "task", task_id = %self.id, error = %err, "Task failed");
            self.events.emit(&TaskEvent::Error {
                task_id: self.id.clone(),
                message: err.to_string(),
                storage: false,
            });
        }
        // The record is kept so the host can retry with the same file
        self.update_record_status(TaskState::Error);
        self.persist_record();
        // Release in-flight work; a failed task uploads nothing further
        self.cancel.cancel();
    }

    /// Raise a task-level failure from a chunk job. The record survives for
    /// a later manual retry.
    fn fail_task(&self, err: UploadError) {
        if err.is_cancelled() {
            return;
        }
        *self.fatal.lock().expect("fatal poisoned") = Some(err.clone());
        self.finish_error(err);
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn mark_uploading(&self) {
        let _guard = self.transition_lock.lock().expect("transition poisoned");
        {
            let mut state = self.state.write().expect("task state poisoned");
            if !matches!(*state, TaskState::Hashing | TaskState::Idle) {
                return;
            }
            *state = TaskState::Uploading;
        }
        self.update_record_status(TaskState::Uploading);
    }

    fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    async fn pause_changed(&self) {
        let mut rx = self.pause_tx.subscribe();
        let _ = rx.changed().await;
    }

    async fn wait_while_paused(&self) -> UploadResult<()> {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn wait_for_settle(&self) {
        let notified = self.settle_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.inflight.is_empty() {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = self.cancel.cancelled() => {}
            _ = self.pause_changed() => {}
        }
    }

    fn all_chunks_acked(&self) -> bool {
        let plan = self.plan.lock().expect("plan poisoned");
        (0..plan.len()).all(|index| self.completed.contains_key(&index))
    }

    async fn current_token(&self) -> String {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.upload_token.clone())
            .unwrap_or_default()
    }

    fn reseed_progress(&self) {
        let plan = self.plan.lock().expect("plan poisoned");
        let uploaded: u64 = self
            .completed
            .iter()
            .filter_map(|e| plan.get(*e.key()).map(|c| c.size))
            .sum();
        self.progress.seed(uploaded, self.completed.len());
    }

    fn update_record_status(&self, status: TaskState) {
        let mut record = self.record.lock().expect("record poisoned");
        record.status = status;
        record.touch();
    }

    fn persist_record(&self) {
        // Cancelled and succeeded tasks have no record to keep current
        if matches!(self.state(), TaskState::Cancelled | TaskState::Success) {
            return;
        }
        let record = self.record.lock().expect("record poisoned").clone();
        if let Err(err) = self.store.put(&record) {
            warn!(
                target: "store",
                task_id = %self.id,
                error = %err,
                "Failed to persist task record, continuing in memory"
            );
            self.events.emit(&TaskEvent::Error {
                task_id: self.id.clone(),
                message: format!("failed to persist resume record: {err:#}"),
                storage: true,
            });
        }
    }

    /// Wrap an adapter call with the per-call timeout and prompt abort on
    /// cancellation.
    async fn timed<T>(&self, fut: impl Future<Output = UploadResult<T>>) -> UploadResult<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            result = tokio::time::timeout(self.settings.request_timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(UploadError::Timeout),
            },
        }
    }

    /// Shared retry policy for session, verify and merge calls: transient
    /// errors back off, one token refresh is attempted, everything else
    /// surfaces.
    async fn call_with_retry<T, F, Fut>(&self, mut op: F) -> UploadResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let epoch = self.session_epoch.load(Ordering::SeqCst);
            match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(UploadError::TokenExpired) if !refreshed => {
                    refreshed = true;
                    self.refresh_session(epoch).await?;
                }
                Err(err) if err.is_retryable() && attempt < self.settings.retry_count => {
                    attempt += 1;
                    self.backoff(attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff with capped growth, interruptible by cancel.
    async fn backoff(&self, attempt: u32) -> UploadResult<()> {
        let base = self.settings.retry_delay.as_millis() as u64;
        let delay_ms = base.saturating_mul(1 << (attempt - 1).min(10));
        let delay = Duration::from_millis(delay_ms).min(RETRY_MAX_DELAY);
        debug!(
            target: "task::chunk",
            task_id = %self.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }
}
