//! Client-side chunked upload engine.
//!
//! Splits caller-provided files into content-addressed chunks, uploads
//! them concurrently through a pluggable [`adapter::RequestAdapter`],
//! deduplicates against server state, persists resume records across
//! restarts, and reports progress through a typed event surface.
//!
//! ```no_run
//! use std::sync::Arc;
//! use upload_engine::{EngineConfig, LocalFile, ResumeStore, TaskOptions, UploadManager};
//!
//! # async fn example(adapter: Arc<dyn upload_engine::RequestAdapter>) -> anyhow::Result<()> {
//! let store = ResumeStore::open_default()?;
//! let manager = UploadManager::new(adapter, store, EngineConfig::default());
//! manager.init()?;
//!
//! let file = Arc::new(LocalFile::open("video.mp4").await?);
//! let task_id = manager.create_task(file, TaskOptions::default())?;
//! let task = manager.get_task(&task_id).unwrap();
//! task.on(|event| println!("{}: {event:?}", event.name()));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod hasher;
pub mod limiter;
pub mod logging;
pub mod manager;
pub mod plan;
pub mod plugin;
pub mod sizer;
pub mod source;
pub mod store;
pub mod task;

// Re-export commonly used types
pub use adapter::{
    AdapterResult, CreateFileRequest, MergeRequest, MergeResponse, RequestAdapter,
    SessionCredential, UploadChunkRequest, UploadChunkResponse, VerifyRequest, VerifyResponse,
};
pub use config::{EngineConfig, TaskOptions};
pub use error::{UploadError, UploadResult};
pub use events::{EventBus, ListenerId, ManagerEvent, TaskEvent};
pub use manager::{ManagerStats, UploadManager};
pub use plugin::UploadPlugin;
pub use source::{FileSource, LocalFile, MemoryFile};
pub use store::{ResumeStore, TaskRecord, TaskState};
pub use task::{ProgressSnapshot, UploadTask};
