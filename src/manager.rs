//! Task fleet coordination.
//!
//! The manager owns the tasks, the shared adapter, the resume store, a
//! task-level limiter and the plugin registry. On `init` it reloads
//! persisted records and exposes unfinished uploads as waiting-for-file
//! placeholders the host can rebind with a re-selected file.

use crate::adapter::RequestAdapter;
use crate::config::{EngineConfig, TaskOptions};
use crate::error::{UploadError, UploadResult};
use crate::events::{EventBus, ListenerId, ManagerEvent, TaskEvent};
use crate::hasher::HashWorker;
use crate::limiter::Limiter;
use crate::plugin::{self, UploadPlugin};
use crate::source::FileSource;
use crate::store::{ResumeStore, TaskRecord, TaskState};
use crate::task::UploadTask;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{info, warn};
use uuid::Uuid;

/// Task counts by state
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    pub total: usize,
    pub idle: usize,
    pub hashing: usize,
    pub uploading: usize,
    pub paused: usize,
    pub success: usize,
    pub error: usize,
    pub cancelled: usize,
    /// Restored records waiting for the host to rebind a file
    pub awaiting_file: usize,
}

enum ManagedEntry {
    Active(Arc<UploadTask>),
    AwaitingFile(Box<TaskRecord>),
}

/// Coordinates a bounded fleet of upload tasks over one adapter and store.
pub struct UploadManager {
    config: EngineConfig,
    adapter: Arc<dyn RequestAdapter>,
    store: Arc<ResumeStore>,
    tasks: DashMap<String, ManagedEntry>,
    task_gate: Arc<Limiter>,
    hash_worker: Arc<HashWorker>,
    plugins: RwLock<Vec<Arc<dyn UploadPlugin>>>,
    events: EventBus<ManagerEvent>,
    initialized: AtomicBool,
}

impl UploadManager {
    /// Create a manager. Must be called from within a Tokio runtime; the
    /// task-level limiter runs a background dispatcher.
    pub fn new(
        adapter: Arc<dyn RequestAdapter>,
        store: ResumeStore,
        config: EngineConfig,
    ) -> Arc<Self> {
        let config = config.sanitized();
        let task_gate = Limiter::new(config.max_concurrent_tasks);
        Arc::new(Self {
            config,
            adapter,
            store: Arc::new(store),
            tasks: DashMap::new(),
            task_gate,
            hash_worker: Arc::new(HashWorker::new()),
            plugins: RwLock::new(Vec::new()),
            events: EventBus::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// Load persisted records. Non-terminal ones become waiting-for-file
    /// placeholders; call [`UploadManager::resume_task`] to rebind them.
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.config.auto_resume_unfinished {
            return Ok(());
        }

        let records = self.store.list().context("Failed to load resume records")?;
        let mut restored = 0usize;
        for record in records {
            if record.status.is_terminal() {
                continue;
            }
            self.tasks.insert(
                record.task_id.clone(),
                ManagedEntry::AwaitingFile(Box::new(record)),
            );
            restored += 1;
        }
        if restored > 0 {
            info!(target: "manager", count = restored, "Restored unfinished upload records");
        }
        Ok(())
    }

    /// Register a listener for manager events (including forwarded task
    /// events).
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Create a task for a file. Rejects oversized files synchronously.
    pub fn create_task(
        self: &Arc<Self>,
        source: Arc<dyn FileSource>,
        options: TaskOptions,
    ) -> UploadResult<String> {
        if let Some(limit) = self.config.max_file_size {
            if source.size() > limit {
                return Err(UploadError::Validation(format!(
                    "file of {} bytes exceeds the configured limit of {} bytes",
                    source.size(),
                    limit
                )));
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(
            task_id.clone(),
            source.fingerprint(),
            source.name().to_string(),
            source.size(),
            self.config.default_chunk_size,
        );
        if let Err(err) = self.store.put(&record) {
            warn!(
                target: "manager",
                task_id = %task_id,
                error = %err,
                "Failed to persist new task record, task will not be resumable"
            );
        }

        let auto_start = options.auto_start.unwrap_or(self.config.auto_start);
        let task = UploadTask::new(
            source,
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            &self.config,
            &options,
            record,
            false,
            Some(Arc::clone(&self.task_gate)),
            Arc::clone(&self.hash_worker),
        );
        self.wire(&task);
        self.tasks
            .insert(task_id.clone(), ManagedEntry::Active(Arc::clone(&task)));

        for plugin in self.plugins_snapshot() {
            if let Err(err) = plugin.on_task_created(&task_id) {
                warn!(
                    target: "manager",
                    plugin = plugin.name(),
                    error = %err,
                    "Plugin hook failed, continuing"
                );
            }
        }
        info!(target: "manager", task_id = %task_id, "Task created");
        self.events.emit(&ManagerEvent::TaskCreated {
            task_id: task_id.clone(),
        });

        if auto_start {
            task.start();
        }
        Ok(task_id)
    }

    /// Rebind a re-selected file to a restored record and resume it. The
    /// file's fingerprint must match the record's.
    pub fn resume_task(
        self: &Arc<Self>,
        task_id: &str,
        source: Arc<dyn FileSource>,
    ) -> UploadResult<Arc<UploadTask>> {
        let record = match self.tasks.get(task_id) {
            Some(entry) => match &*entry {
                ManagedEntry::AwaitingFile(record) => (**record).clone(),
                ManagedEntry::Active(_) => {
                    return Err(UploadError::Validation(format!(
                        "task {task_id} is already bound to a file"
                    )));
                }
            },
            None => {
                return Err(UploadError::Validation(format!("unknown task {task_id}")));
            }
        };

        if record.file_fingerprint != source.fingerprint() {
            return Err(UploadError::Validation(format!(
                "file fingerprint {} does not match record {}",
                source.fingerprint(),
                record.file_fingerprint
            )));
        }

        let task = UploadTask::new(
            source,
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            &self.config,
            &TaskOptions::default(),
            record,
            true,
            Some(Arc::clone(&self.task_gate)),
            Arc::clone(&self.hash_worker),
        );
        self.wire(&task);
        self.tasks
            .insert(task_id.to_string(), ManagedEntry::Active(Arc::clone(&task)));
        info!(target: "manager", task_id, "Resuming restored task");
        task.resume();
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<UploadTask>> {
        self.tasks.get(task_id).and_then(|entry| match &*entry {
            ManagedEntry::Active(task) => Some(Arc::clone(task)),
            ManagedEntry::AwaitingFile(_) => None,
        })
    }

    pub fn all_tasks(&self) -> Vec<Arc<UploadTask>> {
        self.tasks
            .iter()
            .filter_map(|entry| match &*entry {
                ManagedEntry::Active(task) => Some(Arc::clone(task)),
                ManagedEntry::AwaitingFile(_) => None,
            })
            .collect()
    }

    /// Cancel (if running) and forget a task, deleting its resume record.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let Some((_, entry)) = self.tasks.remove(task_id) else {
            return Ok(false);
        };
        if let ManagedEntry::Active(task) = &entry {
            if !task.state().is_terminal() {
                task.cancel();
            }
        }
        self.store
            .delete(task_id)
            .context("Failed to delete task record")?;
        self.events.emit(&ManagerEvent::TaskDeleted {
            task_id: task_id.to_string(),
        });
        Ok(true)
    }

    pub fn pause_all(&self) {
        for task in self.all_tasks() {
            task.pause();
        }
    }

    pub fn resume_all(&self) {
        for task in self.all_tasks() {
            task.resume();
        }
    }

    pub fn cancel_all(&self) {
        for task in self.all_tasks() {
            task.cancel();
        }
    }

    /// Drop tasks that finished successfully. Their records are already
    /// gone; this only releases the in-memory handles.
    pub fn clear_completed(&self) -> usize {
        let mut removed = 0usize;
        self.tasks.retain(|_, entry| match entry {
            ManagedEntry::Active(task) if task.state() == TaskState::Success => {
                removed += 1;
                false
            }
            _ => true,
        });
        removed
    }

    pub fn statistics(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for entry in self.tasks.iter() {
            stats.total += 1;
            match &*entry {
                ManagedEntry::AwaitingFile(_) => stats.awaiting_file += 1,
                ManagedEntry::Active(task) => match task.state() {
                    TaskState::Idle => stats.idle += 1,
                    TaskState::Hashing => stats.hashing += 1,
                    TaskState::Uploading => stats.uploading += 1,
                    TaskState::Paused => stats.paused += 1,
                    TaskState::Success => stats.success += 1,
                    TaskState::Error => stats.error += 1,
                    TaskState::Cancelled => stats.cancelled += 1,
                },
            }
        }
        stats
    }

    /// Register a plugin. Its `install` hook runs immediately.
    pub fn register_plugin(&self, plugin: Arc<dyn UploadPlugin>) {
        if let Err(err) = plugin.install() {
            warn!(
                target: "manager",
                plugin = plugin.name(),
                error = %err,
                "Plugin install failed, registering anyway"
            );
        }
        self.plugins
            .write()
            .expect("plugin registry poisoned")
            .push(plugin);
    }

    /// Pause everything so records capture a resumable state, then stop.
    /// Records stay on disk; a later `init` restores them.
    pub fn close(&self) {
        self.pause_all();
        info!(target: "manager", "Upload manager closed");
    }

    fn plugins_snapshot(&self) -> Vec<Arc<dyn UploadPlugin>> {
        self.plugins
            .read()
            .expect("plugin registry poisoned")
            .clone()
    }

    /// Forward a task's events to plugins and the manager bus.
    fn wire(self: &Arc<Self>, task: &Arc<UploadTask>) {
        let manager: Weak<UploadManager> = Arc::downgrade(self);
        task.on(move |event: &TaskEvent| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            for plugin in manager.plugins_snapshot() {
                plugin::dispatch_event(plugin.as_ref(), event);
            }
            manager.events.emit(&ManagerEvent::Task(event.clone()));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::hasher;
    use crate::source::MemoryFile;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.min_chunk_size = 16;
        config.max_chunk_size = 16;
        config.default_chunk_size = 16;
        config.retry_delay = Duration::from_millis(10);
        config.verify_batch_window = Duration::from_millis(5);
        config
    }

    fn manager_at(
        dir: &TempDir,
        adapter: &Arc<MockAdapter>,
        config: EngineConfig,
    ) -> Arc<UploadManager> {
        let store = ResumeStore::open(dir.path().join("resume.db")).unwrap();
        UploadManager::new(adapter.clone() as Arc<dyn RequestAdapter>, store, config)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn wait_state(manager: &Arc<UploadManager>, task_id: &str, want: TaskState) {
        for _ in 0..1000 {
            if let Some(task) = manager.get_task(task_id) {
                if task.state() == want {
                    return;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {want:?}");
    }

    #[tokio::test]
    async fn create_task_uploads_to_success() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let manager = manager_at(&dir, &adapter, test_config());
        manager.init().unwrap();

        let task_id = manager
            .create_task(
                Arc::new(MemoryFile::new("a.bin", payload(64))),
                TaskOptions::default(),
            )
            .unwrap();
        wait_state(&manager, &task_id, TaskState::Success).await;

        assert_eq!(adapter.merge_calls.load(AtomicOrdering::SeqCst), 1);
        let stats = manager.statistics();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_synchronously() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let mut config = test_config();
        config.max_file_size = Some(32);
        let manager = manager_at(&dir, &adapter, config);

        let err = manager
            .create_task(
                Arc::new(MemoryFile::new("big.bin", payload(64))),
                TaskOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(manager.statistics().total, 0);
        assert_eq!(adapter.create_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_start_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let manager = manager_at(&dir, &adapter, test_config());

        let task_id = manager
            .create_task(
                Arc::new(MemoryFile::new("manual.bin", payload(32))),
                TaskOptions {
                    auto_start: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        let task = manager.get_task(&task_id).unwrap();
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(adapter.create_calls.load(AtomicOrdering::SeqCst), 0);

        task.start();
        wait_state(&manager, &task_id, TaskState::Success).await;
    }

    #[tokio::test]
    async fn crash_and_resume_uploads_only_missing_chunks() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let data = payload(160);

        // First life: write the record a crashed engine would leave behind
        {
            let store = ResumeStore::open(dir.path().join("resume.db")).unwrap();
            let source = MemoryFile::new("crash.bin", data.clone());
            let mut record =
                TaskRecord::new("crashed", source.fingerprint(), "crash.bin", 160, 16);
            record.status = TaskState::Uploading;
            for index in [0usize, 2, 4, 6, 8] {
                record
                    .completed_chunks
                    .insert(index, hasher::digest(&data[index * 16..(index + 1) * 16]));
            }
            store.put(&record).unwrap();
            store.close();
        }
        adapter.seed_chunks([0usize, 2, 4, 6, 8].map(|i| &data[i * 16..(i + 1) * 16]));

        // Second life
        let manager = manager_at(&dir, &adapter, test_config());
        manager.init().unwrap();
        assert_eq!(manager.statistics().awaiting_file, 1);
        assert!(manager.get_task("crashed").is_none());

        let task = manager
            .resume_task("crashed", Arc::new(MemoryFile::new("crash.bin", data.clone())))
            .unwrap();
        wait_state(&manager, "crashed", TaskState::Success).await;

        let mut uploaded = adapter.uploaded_indices();
        uploaded.sort_unstable();
        assert_eq!(uploaded, vec![1, 3, 5, 7, 9]);
        assert_eq!(task.progress().uploaded_bytes, 160);
        let merged = adapter.merged_request().unwrap();
        assert_eq!(merged.chunk_hashes.len(), 10);
        assert_eq!(merged.file_hash, hasher::digest(&data));
    }

    #[tokio::test]
    async fn resume_task_rejects_a_different_file() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        {
            let store = ResumeStore::open(dir.path().join("resume.db")).unwrap();
            let source = MemoryFile::new("orig.bin", payload(64));
            let mut record =
                TaskRecord::new("orig", source.fingerprint(), "orig.bin", 64, 16);
            record.status = TaskState::Uploading;
            store.put(&record).unwrap();
            store.close();
        }

        let manager = manager_at(&dir, &adapter, test_config());
        manager.init().unwrap();
        let err = manager
            .resume_task("orig", Arc::new(MemoryFile::new("other.bin", payload(64))))
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(manager.statistics().awaiting_file, 1);
    }

    #[tokio::test]
    async fn events_are_forwarded_with_task_ids() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let manager = manager_at(&dir, &adapter, test_config());

        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&names);
        manager.on(move |event| {
            seen.lock().unwrap().push(event.name().to_string());
        });

        let task_id = manager
            .create_task(
                Arc::new(MemoryFile::new("ev.bin", payload(32))),
                TaskOptions::default(),
            )
            .unwrap();
        wait_state(&manager, &task_id, TaskState::Success).await;

        let names = names.lock().unwrap();
        assert_eq!(names.first().map(String::as_str), Some("TaskCreated"));
        assert!(names.iter().any(|n| n == "Started"));
        assert!(names.iter().any(|n| n == "Success"));
    }

    #[tokio::test]
    async fn plugins_observe_the_lifecycle() {
        struct Counter {
            created: AtomicUsize,
            succeeded: AtomicUsize,
        }
        impl UploadPlugin for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn on_task_created(&self, _task_id: &str) -> Result<()> {
                self.created.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
            fn on_task_success(&self, _task_id: &str, _file_url: &str) -> Result<()> {
                self.succeeded.fetch_add(1, AtomicOrdering::SeqCst);
                anyhow::bail!("plugin errors must not affect the task")
            }
        }

        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let manager = manager_at(&dir, &adapter, test_config());
        let plugin = Arc::new(Counter {
            created: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
        });
        manager.register_plugin(plugin.clone());

        let task_id = manager
            .create_task(
                Arc::new(MemoryFile::new("p.bin", payload(32))),
                TaskOptions::default(),
            )
            .unwrap();
        wait_state(&manager, &task_id, TaskState::Success).await;

        assert_eq!(plugin.created.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(plugin.succeeded.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(manager.get_task(&task_id).unwrap().state(), TaskState::Success);
    }

    #[tokio::test]
    async fn clear_completed_releases_finished_tasks() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let manager = manager_at(&dir, &adapter, test_config());

        let done = manager
            .create_task(
                Arc::new(MemoryFile::new("done.bin", payload(16))),
                TaskOptions::default(),
            )
            .unwrap();
        let idle = manager
            .create_task(
                Arc::new(MemoryFile::new("idle.bin", payload(16))),
                TaskOptions {
                    auto_start: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        wait_state(&manager, &done, TaskState::Success).await;

        assert_eq!(manager.clear_completed(), 1);
        assert!(manager.get_task(&done).is_none());
        assert!(manager.get_task(&idle).is_some());
    }

    #[tokio::test]
    async fn delete_task_cancels_and_forgets() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_upload_delay(Duration::from_millis(20));
        let manager = manager_at(&dir, &adapter, test_config());

        let task_id = manager
            .create_task(
                Arc::new(MemoryFile::new("del.bin", payload(320))),
                TaskOptions::default(),
            )
            .unwrap();
        let task = manager.get_task(&task_id).unwrap();
        sleep(Duration::from_millis(30)).await;

        assert!(manager.delete_task(&task_id).unwrap());
        assert!(manager.get_task(&task_id).is_none());
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(!manager.delete_task(&task_id).unwrap());
    }

    #[tokio::test]
    async fn many_tasks_respect_the_task_gate() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_upload_delay(Duration::from_millis(5));
        let mut config = test_config();
        config.max_concurrent_tasks = 2;
        let manager = manager_at(&dir, &adapter, config);

        let ids: Vec<String> = (0..6)
            .map(|i| {
                manager
                    .create_task(
                        Arc::new(MemoryFile::new(format!("f{i}.bin"), payload(48 + i))),
                        TaskOptions::default(),
                    )
                    .unwrap()
            })
            .collect();

        for id in &ids {
            wait_state(&manager, id, TaskState::Success).await;
        }
        let stats = manager.statistics();
        assert_eq!(stats.success, 6);
    }
}
