//! Message sinks: where relayed mesh text ends up.
//!
//! The gateway only needs to hand off formatted lines (`"[Alice] hello"`); the chat
//! service on the other side is out of scope. [`LogSink`] writes lines to the log and is
//! what `meshgate start` uses; [`ChannelSink`] forwards them to an mpsc receiver so an
//! embedding application (or a test) can consume them.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::logutil::escape_log;

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Queue one line for delivery. Must not block the caller.
    fn enqueue(&self, text: String);

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);
}

#[derive(Debug, Default)]
pub struct LogSink {
    running: AtomicBool,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageSink for LogSink {
    fn enqueue(&self, text: String) {
        if !self.running.load(Ordering::Relaxed) {
            debug!("Log sink not started, message still logged");
        }
        info!("[relay] {}", escape_log(&text));
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Forwards every line to the receiver returned by [`ChannelSink::new`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    fn enqueue(&self, text: String) {
        if self.tx.send(text).is_err() {
            warn!("Message sink receiver dropped; discarding message");
        }
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.start().await.unwrap();
        sink.enqueue("one".into());
        sink.enqueue("two".into());
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.enqueue("lost".into());
        sink.stop().await;
    }

    #[tokio::test]
    async fn log_sink_start_stop() {
        let sink = LogSink::new();
        sink.start().await.unwrap();
        sink.enqueue("hello".into());
        sink.stop().await;
    }
}
