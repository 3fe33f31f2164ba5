//! The progress ticker.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns the ticker that publishes run progress.
///
/// Every `tick`, the ticker estimates progress as elapsed time over the
/// expected duration, capped at 99.0 while the conveyor runs. The single-slot
/// channel keeps only the latest value. The ticker re-checks cancellation
/// before every send and exits on cancel or once the conveyor has taken the
/// sender away; closing the channel is the conveyor's job, never the
/// ticker's.
pub(crate) fn spawn_ticker(
    sender: Arc<Mutex<Option<watch::Sender<f64>>>>,
    token: CancellationToken,
    tick: Duration,
    expected: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            if token.is_cancelled() {
                break;
            }

            let elapsed = started.elapsed().as_secs_f64();
            let percent = (elapsed / expected.as_secs_f64()) * 100.0;
            let percent = percent.min(99.0);

            let guard = sender.lock();
            match guard.as_ref() {
                Some(sender) => {
                    let _ = sender.send(percent);
                }
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticker_publishes_capped_values() {
        let (tx, rx) = watch::channel(0.0);
        let sender = Arc::new(Mutex::new(Some(tx)));
        let token = CancellationToken::new();

        let handle = spawn_ticker(
            Arc::clone(&sender),
            token.clone(),
            Duration::from_millis(10),
            Duration::from_millis(1),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();

        // Expected duration long past, so the estimate saturates below 100.
        assert!((*rx.borrow() - 99.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_cancel() {
        let (tx, _rx) = watch::channel(0.0);
        let sender = Arc::new(Mutex::new(Some(tx)));
        let token = CancellationToken::new();

        let handle = spawn_ticker(
            sender,
            token.clone(),
            Duration::from_millis(10),
            Duration::from_secs(3600),
        );

        token.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("ticker must stop promptly after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ticker_stops_once_sender_is_taken() {
        let (tx, _rx) = watch::channel(0.0);
        let sender = Arc::new(Mutex::new(Some(tx)));
        let token = CancellationToken::new();

        let handle = spawn_ticker(
            Arc::clone(&sender),
            token,
            Duration::from_millis(5),
            Duration::from_secs(3600),
        );

        sender.lock().take();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("ticker must stop once the channel is closed")
            .unwrap();
    }
}
