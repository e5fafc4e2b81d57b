//! Runs one request on its own thread.

use poll_promise::Promise;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{Backend, StreamSink};
use crate::error::{RemoteError, ValidationError};
use crate::request::RequestDescriptor;
use crate::result::{Chunk, ResultContainer};

pub type TaskId = u64;

// Large buffer so fast token streams never stall on a slow frame
const EVENT_BUFFER: usize = 16384;

/// How a worker ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(ResultContainer),
    Failed(RemoteError, ResultContainer),
    Cancelled,
}

pub struct WorkerTask {
    id: TaskId,
    events: Receiver<Chunk>,
    cancel: Arc<AtomicBool>,
    outcome: Promise<Outcome>,
}

impl WorkerTask {
    /// Validate the request and launch it on a fresh thread.
    ///
    /// Never blocks on the network; only a malformed request fails here.
    pub fn start(id: TaskId, request: RequestDescriptor, backend: Arc<dyn Backend>) -> Result<Self, ValidationError> {
        request.validate()?;

        let (tx, rx) = sync_channel(EVENT_BUFFER);
        let cancel = Arc::new(AtomicBool::new(false));
        let sink = StreamSink::new(ResultContainer::for_request(&request), tx, Arc::clone(&cancel));

        tracing::debug!(
            "Starting task {} ({}, model {}) on {}",
            id,
            request.target().as_str(),
            request.model(),
            backend.name()
        );

        let outcome = Promise::spawn_thread(format!("worker-{}", id), move || run(request, backend, sink));

        Ok(Self {
            id,
            events: rx,
            cancel,
            outcome,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Ask the worker to stop between chunks. The remote call may keep running.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn try_recv(&self) -> Option<Chunk> {
        self.events.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.ready().is_some()
    }

    /// Take the outcome if the worker is done, otherwise hand the task back.
    pub fn try_finish(self) -> Result<Outcome, Self> {
        let Self {
            id,
            events,
            cancel,
            outcome,
        } = self;
        outcome.try_take().map_err(|outcome| Self {
            id,
            events,
            cancel,
            outcome,
        })
    }
}

fn run(request: RequestDescriptor, backend: Arc<dyn Backend>, mut sink: StreamSink) -> Outcome {
    let started = Instant::now();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return failed(sink, RemoteError::Runtime(e), started),
    };

    let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(backend.invoke(&request, &mut sink))
    }));
    let invoked = invoked.unwrap_or_else(|payload| Err(RemoteError::Panicked(panic_message(payload))));

    // Nothing of a cancelled task is reported, not even its error
    if sink.is_cancelled() {
        tracing::debug!("Worker for {} observed cancellation", request.model());
        return Outcome::Cancelled;
    }

    match invoked {
        Ok(()) => {
            let mut result = sink.into_result();
            result.elapsed = started.elapsed();
            Outcome::Completed(result)
        }
        Err(e) => failed(sink, e, started),
    }
}

fn failed(sink: StreamSink, error: RemoteError, started: Instant) -> Outcome {
    let mut partial = sink.into_result();
    partial.elapsed = started.elapsed();
    partial.error = Some(error.to_string());
    Outcome::Failed(error, partial)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
