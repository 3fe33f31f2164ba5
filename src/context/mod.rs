//! The shared cancellation and reporting context for a conveyor run.
//!
//! Every stage of a conveyor receives the same [`ConveyorContext`]. It carries
//! the cancellation token that coordinates shutdown, an optional deadline, and
//! the two reporting sinks: a lossy bounded log sink and a single-slot,
//! latest-wins status sink.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::Error;

/// Buffered capacity of the log sink. Producers never block; once receivers
/// lag by more than this, the oldest messages are dropped.
pub const LOG_SINK_CAPACITY: usize = 100;

/// Severity of a conveyor log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine progress notes.
    Info,
    /// Recoverable trouble, e.g. a dropped item.
    Warn,
    /// A worker or stage failed.
    Error,
    /// Misconfiguration that aborts the process.
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// One unit of logging passed back through the conveyor's log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    /// Severity of the message.
    pub level: LogLevel,
    /// Human-readable text.
    pub text: String,
    /// Rendered error, when the message reports a failure.
    pub error: Option<String>,
    /// When the message was produced.
    pub at: DateTime<Utc>,
}

impl LogMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(level: LogLevel, text: impl Into<String>, error: Option<&Error>) -> Self {
        Self {
            level,
            text: text.into(),
            error: error.map(ToString::to_string),
            at: Utc::now(),
        }
    }
}

/// The reporting sinks shared by a context and all of its children.
///
/// Both senders live behind a one-shot take: the first `close` drops them,
/// later sends become silent no-ops, and subscribers observe end-of-stream.
struct ContextSinks {
    logs: Mutex<Option<broadcast::Sender<LogMessage>>>,
    status: Mutex<Option<watch::Sender<String>>>,
}

impl ContextSinks {
    fn new() -> Self {
        let (logs, _) = broadcast::channel(LOG_SINK_CAPACITY);
        let (status, _) = watch::channel(String::new());
        Self {
            logs: Mutex::new(Some(logs)),
            status: Mutex::new(Some(status)),
        }
    }

    fn close(&self) {
        self.logs.lock().take();
        self.status.lock().take();
    }
}

/// The capability set every stage of a running conveyor is handed.
///
/// The default implementation is [`StandardContext`]; a custom implementation
/// can be substituted through `Conveyor::set_context` to intercept logging or
/// integrate with an outer cancellation scope.
pub trait ConveyorContext: Send + Sync {
    /// Name of the conveyor this context belongs to.
    fn name(&self) -> &str;

    /// Returns a clone of the cancellation token.
    ///
    /// The token is cheap to clone and supports both polling
    /// (`is_cancelled`) and awaiting (`cancelled().await`).
    fn token(&self) -> CancellationToken;

    /// Returns true once the context has been cancelled or timed out.
    fn is_done(&self) -> bool;

    /// The instant at which this context expires, if a timeout was attached.
    fn deadline(&self) -> Option<Instant>;

    /// Cancels this context and every child derived from it.
    ///
    /// Idempotent: the first call closes the reporting sinks, later calls do
    /// nothing.
    fn cancel(&self);

    /// Derives a child context that can be cancelled independently.
    ///
    /// Cancelling the parent cascades to the child, never the reverse.
    fn child_cancelable(&self) -> Arc<dyn ConveyorContext>;

    /// Derives a child context that expires after `timeout`.
    ///
    /// The deadline is fixed at call time; a parent deadline that comes
    /// sooner wins. The conveyor arms the expiry watchdog when it starts.
    fn child_with_timeout(&self, timeout: Duration) -> Arc<dyn ConveyorContext>;

    /// Publishes a log message on the log sink.
    ///
    /// Never blocks. When receivers lag past the sink capacity the oldest
    /// messages are dropped; after `cancel` the call is a silent no-op.
    fn send_log(&self, level: LogLevel, text: &str, error: Option<&Error>);

    /// Publishes a status line, overwriting whatever was there before.
    ///
    /// After `cancel` the call is a silent no-op.
    fn send_status(&self, status: &str);

    /// Subscribes to the log sink, or `None` once the sinks are closed.
    fn subscribe_logs(&self) -> Option<broadcast::Receiver<LogMessage>>;

    /// Subscribes to the status sink, or `None` once the sinks are closed.
    fn subscribe_status(&self) -> Option<watch::Receiver<String>>;
}

/// The default [`ConveyorContext`] implementation.
pub struct StandardContext {
    name: String,
    token: CancellationToken,
    deadline: Option<Instant>,
    sinks: Arc<ContextSinks>,
}

impl StandardContext {
    /// Creates a root context with fresh sinks and no deadline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            token: CancellationToken::new(),
            deadline: None,
            sinks: Arc::new(ContextSinks::new()),
        })
    }

    fn child(&self, deadline: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            token: self.token.child_token(),
            deadline,
            sinks: Arc::clone(&self.sinks),
        })
    }
}

impl ConveyorContext for StandardContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn cancel(&self) {
        self.token.cancel();
        self.sinks.close();
    }

    fn child_cancelable(&self) -> Arc<dyn ConveyorContext> {
        self.child(self.deadline)
    }

    fn child_with_timeout(&self, timeout: Duration) -> Arc<dyn ConveyorContext> {
        let requested = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < requested => parent,
            _ => requested,
        };
        self.child(Some(deadline))
    }

    fn send_log(&self, level: LogLevel, text: &str, error: Option<&Error>) {
        if self.is_done() {
            return;
        }
        if let Some(sender) = self.sinks.logs.lock().as_ref() {
            // No receivers, or receivers lagging, both mean the message is
            // dropped. That is the lossy contract of the sink.
            let _ = sender.send(LogMessage::new(level, text, error));
        }
    }

    fn send_status(&self, status: &str) {
        if self.is_done() {
            return;
        }
        if let Some(sender) = self.sinks.status.lock().as_ref() {
            sender.send_replace(status.to_string());
        }
    }

    fn subscribe_logs(&self) -> Option<broadcast::Receiver<LogMessage>> {
        self.sinks.logs.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    fn subscribe_status(&self) -> Option<watch::Receiver<String>> {
        self.sinks.status.lock().as_ref().map(watch::Sender::subscribe)
    }
}

impl fmt::Debug for StandardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardContext")
            .field("name", &self.name)
            .field("done", &self.is_done())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = StandardContext::new("test");
        assert!(!ctx.is_done());

        ctx.cancel();
        ctx.cancel();
        ctx.cancel();

        assert!(ctx.is_done());
    }

    #[test]
    fn test_cancel_cascades_to_children() {
        let root = StandardContext::new("test");
        let child = root.child_cancelable();
        let grandchild = child.child_cancelable();

        root.cancel();

        assert!(child.is_done());
        assert!(grandchild.is_done());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let root = StandardContext::new("test");
        let child = root.child_cancelable();

        child.cancel();

        assert!(child.is_done());
        assert!(!root.is_done());
    }

    #[test]
    fn test_timeout_child_keeps_earliest_deadline() {
        let root = StandardContext::new("test");
        let near = root.child_with_timeout(Duration::from_millis(10));
        let far = near.child_with_timeout(Duration::from_secs(3600));

        assert!(far.deadline().unwrap() <= near.deadline().unwrap());
    }

    #[tokio::test]
    async fn test_status_latest_wins() {
        let ctx = StandardContext::new("test");
        let rx = ctx.subscribe_status().unwrap();

        ctx.send_status("first");
        ctx.send_status("second");
        ctx.send_status("third");

        assert_eq!(*rx.borrow(), "third");
    }

    #[tokio::test]
    async fn test_log_sink_never_blocks() {
        let ctx = StandardContext::new("test");
        let mut rx = ctx.subscribe_logs().unwrap();

        // Far more messages than the sink holds; none of these may block.
        for i in 0..(LOG_SINK_CAPACITY * 3) {
            ctx.send_log(LogLevel::Info, &format!("message {i}"), None);
        }

        // The oldest messages were dropped, the newest survive.
        let first = loop {
            match rx.recv().await {
                Ok(msg) => break msg,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("sink closed"),
            }
        };
        assert!(first.text.starts_with("message"));
    }

    #[tokio::test]
    async fn test_sinks_closed_after_cancel() {
        let ctx = StandardContext::new("test");
        ctx.cancel();

        assert!(ctx.subscribe_logs().is_none());
        assert!(ctx.subscribe_status().is_none());

        // Sends after close are silent no-ops.
        ctx.send_log(LogLevel::Warn, "too late", None);
        ctx.send_status("too late");
    }

    #[tokio::test]
    async fn test_token_supports_awaiting() {
        let ctx = StandardContext::new("test");
        let token = ctx.token();

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });

        ctx.cancel();
        waiter.await.unwrap();
    }

    #[test]
    fn test_log_message_carries_error_text() {
        let msg = LogMessage::new(LogLevel::Error, "boom", Some(&Error::SinkInternal));
        assert_eq!(msg.error.as_deref(), Some("sink executor internal error"));
    }
}
