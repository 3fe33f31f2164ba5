//! Bounded edges between stages.
//!
//! An edge is a bounded FIFO of [`Item`]s with producer-side close. The
//! producer stage owns the [`OutputPort`] and closes the edge by dropping it
//! exactly once; the consumer stage owns the [`InputPort`], drains buffered
//! items after close, then observes end-of-stream.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::item::Item;

/// Creates a bounded edge with the given capacity.
///
/// Returns the producer side first. Capacity must be positive; the conveyor
/// builder normalizes non-positive buffer lengths before edges are built.
#[must_use]
pub fn edge(capacity: usize) -> (OutputPort, InputPort) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        OutputPort { tx },
        InputPort {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The consumer side of an edge.
///
/// Cloning shares the same underlying queue, which is how the workers of one
/// pool distribute items among themselves: each `recv` hands the next item to
/// exactly one caller.
#[derive(Clone)]
pub struct InputPort {
    rx: Arc<Mutex<mpsc::Receiver<Item>>>,
}

impl InputPort {
    /// Receives the next item, suspending while the edge is empty.
    ///
    /// Returns `None` once the producer closed the edge and the buffer has
    /// drained.
    pub async fn recv(&self) -> Option<Item> {
        self.rx.lock().await.recv().await
    }

    /// Cancellation-aware receive.
    ///
    /// Returns `None` either on end-of-stream or as soon as `token` fires,
    /// whichever comes first.
    pub async fn recv_or_cancel(&self, token: &CancellationToken) -> Option<Item> {
        tokio::select! {
            biased;
            () = token.cancelled() => None,
            item = self.recv() => item,
        }
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort").finish_non_exhaustive()
    }
}

/// The producer side of an edge.
///
/// The owning stage holds the last clone; dropping it closes the edge. The
/// runtime guarantees that happens exactly once, after cleanup.
#[derive(Clone)]
pub struct OutputPort {
    tx: mpsc::Sender<Item>,
}

impl OutputPort {
    /// Sends an item, suspending while the edge is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the consumer side has gone away.
    pub async fn send(&self, item: Item) -> Result<()> {
        self.tx.send(item).await.map_err(|_| Error::ChannelClosed)
    }

    /// Sends an item unless cancellation fires first.
    ///
    /// A send racing cancellation either delivers the item or discards it,
    /// never blocks after the token fires. Returns true when delivered.
    pub async fn send_or_cancel(&self, token: &CancellationToken, item: Item) -> bool {
        tokio::select! {
            biased;
            () = token.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_then_recv() {
        let (out, input) = edge(4);

        out.send(Item::new().with("num", 1)).await.unwrap();
        out.send(Item::new().with("num", 2)).await.unwrap();

        assert_eq!(input.recv().await.unwrap().get_i64("num"), Some(1));
        assert_eq!(input.recv().await.unwrap().get_i64("num"), Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (out, input) = edge(4);
        out.send(Item::new().with("num", 9)).await.unwrap();
        drop(out);

        assert!(input.recv().await.is_some());
        assert!(input.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_consumer_gone() {
        let (out, input) = edge(1);
        drop(input);

        let err = out.send(Item::new()).await.unwrap_err();
        assert_eq!(err, Error::ChannelClosed);
    }

    #[tokio::test]
    async fn test_send_or_cancel_never_blocks_after_cancel() {
        let (out, _input) = edge(1);
        let token = CancellationToken::new();

        // Fill the buffer so the next send would suspend.
        assert!(out.send_or_cancel(&token, Item::new()).await);

        token.cancel();
        let delivered = tokio::time::timeout(
            Duration::from_millis(100),
            out.send_or_cancel(&token, Item::new()),
        )
        .await
        .expect("send_or_cancel must return promptly after cancel");
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_recv_or_cancel_unblocks_on_cancel() {
        let (_out, input) = edge(1);
        let token = CancellationToken::new();

        let waiter = tokio::spawn({
            let input = input.clone();
            let token = token.clone();
            async move { input.recv_or_cancel(&token).await }
        });

        token.cancel();
        let received = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("recv_or_cancel must return promptly after cancel")
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_clones_share_one_queue() {
        let (out, input) = edge(8);
        let second = input.clone();

        out.send(Item::new().with("num", 1)).await.unwrap();
        out.send(Item::new().with("num", 2)).await.unwrap();
        drop(out);

        let a = input.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_ne!(a.get_i64("num"), b.get_i64("num"));
        assert!(input.recv().await.is_none());
    }
}
