//! Pub/sub listeners that keep node-local state in step with peers.
//!
//! A listener subscribes to one channel, hands every payload to its
//! [`ChannelHandler`], and resubscribes with exponential backoff whenever the
//! subscription drops. Messages published while disconnected are lost, so
//! handlers get a [`ChannelHandler::resync`] call after every reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::invalidation::InvalidationCoordinator;
use crate::resilience::ResilienceController;
use crate::store::SharedStore;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Receives messages from one channel.
pub trait ChannelHandler: Send + Sync + 'static {
    fn handle(&self, payload: &str);

    /// Called after a (re)subscription; local state may have missed updates.
    fn resync(&self) {}
}

impl ChannelHandler for InvalidationCoordinator {
    fn handle(&self, payload: &str) {
        self.handle_message(payload);
    }

    fn resync(&self) {
        InvalidationCoordinator::resync(self);
    }
}

impl ChannelHandler for ResilienceController {
    fn handle(&self, payload: &str) {
        self.handle_message(payload);
    }

    fn resync(&self) {
        self.forget_cached_state();
    }
}

/// Spawn a listener that runs until `shutdown` flips to `true`.
pub fn spawn(
    store: Arc<dyn SharedStore>,
    channel: String,
    handler: Arc<dyn ChannelHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        let mut first = true;
        loop {
            tokio::select! {
                result = run(&*store, &channel, &*handler, first) => {
                    first = false;
                    match result {
                        Ok(()) => {
                            debug!(channel = %channel, "subscription ended, resubscribing");
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(e) => {
                            error!(
                                channel = %channel,
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "listener error, reconnecting"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.changed() => break,
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!(channel = %channel, "listener stopped");
    })
}

async fn run(
    store: &dyn SharedStore,
    channel: &str,
    handler: &dyn ChannelHandler,
    first: bool,
) -> Result<(), crate::store::StoreError> {
    let mut stream = store.subscribe(channel).await?;
    info!(channel = %channel, "subscribed");
    if !first {
        handler.resync();
    }
    while let Some(payload) = stream.next().await {
        handler.handle(&payload);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ChannelHandler for Recorder {
        fn handle(&self, payload: &str) {
            self.seen.lock().push(payload.to_string());
        }
    }

    #[tokio::test]
    async fn test_listener_delivers_and_stops() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn(
            Arc::new(store.clone()),
            "chan".to_string(),
            recorder.clone(),
            rx,
        );

        // Wait for the subscription before publishing.
        for _ in 0..50 {
            store.publish("chan", "hello").await.unwrap();
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock()[0], "hello");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
