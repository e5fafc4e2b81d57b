//! Keeps at most one worker running per UI surface and forwards its events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::error::{RemoteError, SubmitError};
use crate::request::RequestDescriptor;
use crate::result::{Chunk, ResultContainer};
use crate::worker::{Outcome, TaskId, WorkerTask};

const WAIT_INTERVAL: Duration = Duration::from_millis(5);

/// The UI side of a surface. All calls happen on the thread that owns the
/// dispatcher.
pub trait UiAdapter {
    fn started(&mut self, task: TaskId);

    fn chunk_received(&mut self, task: TaskId, chunk: &Chunk);

    /// The slot is already free, so the adapter may submit again right away.
    fn completed(&mut self, task: TaskId, result: ResultContainer, dispatcher: &mut Dispatcher);

    fn failed(&mut self, task: TaskId, error: RemoteError, partial: ResultContainer, dispatcher: &mut Dispatcher);
}

/// A new submission is rejected with [`SubmitError::Busy`] while a task is
/// active; call [`Dispatcher::stop`] first to replace it.
pub struct Dispatcher {
    surface: String,
    backend: Arc<dyn Backend>,
    active: Option<WorkerTask>,
    next_task: TaskId,
}

impl Dispatcher {
    pub fn new(surface: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            surface: surface.into(),
            backend,
            active: None,
            next_task: 1,
        }
    }

    pub fn surface(&self) -> &str {
        &self.surface
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.active.as_ref().map(WorkerTask::id)
    }

    /// Swap the backend used by future submissions.
    pub fn set_backend(&mut self, backend: Arc<dyn Backend>) {
        self.backend = backend;
    }

    pub fn submit<A: UiAdapter + ?Sized>(
        &mut self,
        request: RequestDescriptor,
        adapter: &mut A,
    ) -> Result<TaskId, SubmitError> {
        if let Some(task) = &self.active {
            tracing::warn!("Rejecting submission on {}: task {} still running", self.surface, task.id());
            return Err(SubmitError::Busy(self.surface.clone()));
        }

        let id = self.next_task;
        let task = WorkerTask::start(id, request, Arc::clone(&self.backend))?;
        self.next_task += 1;
        self.active = Some(task);

        tracing::info!("Task {} started on {}", id, self.surface);
        adapter.started(id);
        Ok(id)
    }

    /// Cancel the active task. Returns `false` when nothing was running.
    pub fn stop(&mut self) -> bool {
        let Some(task) = self.active.take() else {
            return false;
        };
        task.cancel();
        tracing::info!("Task {} cancelled on {}", task.id(), self.surface);
        // Dropping the task drops its event receiver, so nothing more is delivered
        true
    }

    /// Deliver pending events of the active task. Call once per UI frame.
    ///
    /// Returns `true` if anything was delivered.
    pub fn poll<A: UiAdapter + ?Sized>(&mut self, adapter: &mut A) -> bool {
        let Some(task) = &self.active else {
            return false;
        };
        let id = task.id();

        // Check before draining: every chunk is queued before the outcome is set
        let finished = task.is_finished();
        let mut delivered = false;
        while let Some(chunk) = task.try_recv() {
            adapter.chunk_received(id, &chunk);
            delivered = true;
        }
        if !finished {
            return delivered;
        }

        let Some(task) = self.active.take() else {
            return delivered;
        };
        match task.try_finish() {
            Ok(Outcome::Completed(result)) => {
                tracing::info!("Task {} completed on {} in {:?}", id, self.surface, result.elapsed);
                adapter.completed(id, result, self);
            }
            Ok(Outcome::Failed(error, partial)) => {
                tracing::error!("Task {} failed on {}: {}", id, self.surface, error);
                adapter.failed(id, error, partial, self);
            }
            Ok(Outcome::Cancelled) => {
                tracing::debug!("Task {} ended after cancellation", id);
            }
            Err(task) => {
                self.active = Some(task);
                return delivered;
            }
        }
        true
    }

    /// Poll until the surface is idle or `timeout` elapses.
    ///
    /// Returns `true` if the surface became idle.
    pub fn wait<A: UiAdapter + ?Sized>(&mut self, adapter: &mut A, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll(adapter);
            if !self.is_busy() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_INTERVAL);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(task) = &self.active {
            task.cancel();
        }
    }
}
