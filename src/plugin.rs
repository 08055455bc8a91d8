//! Lifecycle hooks for cross-cutting concerns.
//!
//! Plugins observe the fleet; they can never affect it. A hook that
//! returns an error is logged and skipped, task state is untouched, and
//! the remaining plugins still run, in registration order.

use crate::events::TaskEvent;
use crate::task::ProgressSnapshot;
use anyhow::Result;
use tracing::warn;

/// Optional lifecycle callbacks. Every method defaults to a no-op, so a
/// plugin implements only what it cares about.
#[allow(unused_variables)]
pub trait UploadPlugin: Send + Sync {
    /// Identifies the plugin in logs
    fn name(&self) -> &str;

    /// Called once when the plugin is registered
    fn install(&self) -> Result<()> {
        Ok(())
    }

    fn on_task_created(&self, task_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_task_started(&self, task_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_task_progress(&self, task_id: &str, progress: &ProgressSnapshot) -> Result<()> {
        Ok(())
    }

    fn on_task_success(&self, task_id: &str, file_url: &str) -> Result<()> {
        Ok(())
    }

    fn on_task_error(&self, task_id: &str, message: &str, storage: bool) -> Result<()> {
        Ok(())
    }

    fn on_task_paused(&self, task_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_task_resumed(&self, task_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_task_cancelled(&self, task_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Fan a task event out to a plugin, logging instead of propagating errors.
pub(crate) fn dispatch_event(plugin: &dyn UploadPlugin, event: &TaskEvent) {
    let result = match event {
        TaskEvent::Started { task_id } => plugin.on_task_started(task_id),
        TaskEvent::Progress { task_id, progress } => plugin.on_task_progress(task_id, progress),
        TaskEvent::Success { task_id, file_url } => plugin.on_task_success(task_id, file_url),
        TaskEvent::Error {
            task_id,
            message,
            storage,
        } => plugin.on_task_error(task_id, message, *storage),
        TaskEvent::Paused { task_id } => plugin.on_task_paused(task_id),
        TaskEvent::Resumed { task_id } => plugin.on_task_resumed(task_id),
        TaskEvent::Cancelled { task_id } => plugin.on_task_cancelled(task_id),
        TaskEvent::ChunkSuccess { .. }
        | TaskEvent::ChunkError { .. }
        | TaskEvent::HashProgress { .. }
        | TaskEvent::HashComplete { .. } => Ok(()),
    };

    if let Err(err) = result {
        warn!(
            target: "manager",
            plugin = plugin.name(),
            event = event.name(),
            error = %err,
            "Plugin hook failed, continuing"
        );
    }
}
