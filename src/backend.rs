use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use crate::error::RemoteError;
use crate::request::RequestDescriptor;
use crate::result::{Chunk, FinishReason, ResultContainer, Usage};

/// A remote completion or image API.
///
/// Implementations push partial output into the sink as it arrives and must
/// return as soon as a push reports that the task is no longer wanted.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &RequestDescriptor, sink: &mut StreamSink) -> Result<(), RemoteError>;
}

/// Receives output from a backend on the worker thread.
///
/// Owns the result container for the lifetime of the task and forwards every
/// chunk to the dispatcher.
pub struct StreamSink {
    result: ResultContainer,
    events: SyncSender<Chunk>,
    cancel: Arc<AtomicBool>,
    disconnected: bool,
}

impl StreamSink {
    pub fn new(result: ResultContainer, events: SyncSender<Chunk>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            result,
            events,
            cancel,
            disconnected: false,
        }
    }

    /// Returns `false` once the task has been cancelled or nobody is listening.
    pub fn push(&mut self, chunk: Chunk) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.result.apply(&chunk);
        if self.events.send(chunk).is_err() {
            // Receiver dropped
            self.disconnected = true;
            return false;
        }
        true
    }

    pub fn push_text(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return !self.is_cancelled();
        }
        self.push(Chunk::Text(text.to_string()))
    }

    pub fn push_image(&mut self, bytes: Vec<u8>) -> bool {
        self.push(Chunk::Image(bytes))
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.result.finish_reason = Some(reason);
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.result.usage = usage;
    }

    pub fn set_revised_prompt(&mut self, prompt: String) {
        self.result.revised_prompt = Some(prompt);
    }

    pub fn is_cancelled(&self) -> bool {
        self.disconnected || self.cancel.load(Ordering::Acquire)
    }

    pub fn result(&self) -> &ResultContainer {
        &self.result
    }

    pub fn into_result(self) -> ResultContainer {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    fn sink() -> (StreamSink, std::sync::mpsc::Receiver<Chunk>, Arc<AtomicBool>) {
        let request = RequestDescriptor::chat("m", "p");
        let (tx, rx) = sync_channel(16);
        let cancel = Arc::new(AtomicBool::new(false));
        (StreamSink::new(ResultContainer::for_request(&request), tx, cancel.clone()), rx, cancel)
    }

    #[test]
    fn test_push_forwards_and_accumulates() {
        let (mut sink, rx, _) = sink();
        assert!(sink.push_text("a"));
        assert!(sink.push_text(""));
        assert!(sink.push_text("b"));
        assert_eq!(sink.result().content, "ab");
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_push_stops_after_cancel() {
        let (mut sink, rx, cancel) = sink();
        cancel.store(true, Ordering::Release);
        assert!(!sink.push_text("late"));
        assert!(sink.result().content.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_stops_when_receiver_dropped() {
        let (mut sink, rx, _) = sink();
        drop(rx);
        assert!(!sink.push_text("x"));
        assert!(sink.is_cancelled());
    }
}
