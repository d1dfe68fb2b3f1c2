//! Redis pub/sub-backed bus for raw JSON payloads.
//!
//! Note: Redis pub/sub is not durable (messages published while a subscriber
//! is disconnected are lost). That is acceptable here: the bus only carries
//! notifications and every message is a complete envelope, so the next one
//! (or a reconnect snapshot) heals any gap.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, info, warn};

use hireloop_events::{BusError, EventBus, Subscription};

const RECONNECT_INITIAL: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Redis pub/sub bus on a single channel.
pub struct RedisPubSubBus {
    client: redis::Client,
    channel: String,
    publisher: OnceCell<ConnectionManager>,
}

impl std::fmt::Debug for RedisPubSubBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSubBus")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RedisPubSubBus {
    /// Validate the URL; no connection is made until first use.
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
            publisher: OnceCell::new(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publisher(&self) -> Result<ConnectionManager, BusError> {
        // ConnectionManager reconnects on its own once established.
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| BusError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl EventBus<String> for RedisPubSubBus {
    async fn publish(&self, message: String) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        let _: i64 = conn
            .publish(&self.channel, message)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription<String>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        // Background task that (re)subscribes and forwards payloads until the
        // subscription is dropped.
        let feeder = tokio::spawn(async move {
            let mut delay = RECONNECT_INITIAL;
            loop {
                match forward_until_disconnect(&client, &channel, &tx).await {
                    Forwarded::ReceiverGone => return,
                    Forwarded::Disconnected { delivered, reason } => {
                        if delivered {
                            delay = RECONNECT_INITIAL;
                        }
                        warn!(
                            channel = %channel,
                            error = %reason,
                            retry_in_ms = delay.as_millis() as u64,
                            "bus subscription lost; reconnecting"
                        );
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX);
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(Subscription::with_feeder(rx, feeder))
    }
}

enum Forwarded {
    ReceiverGone,
    Disconnected { delivered: bool, reason: String },
}

async fn forward_until_disconnect(
    client: &redis::Client,
    channel: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> Forwarded {
    let mut pubsub = match client.get_async_pubsub().await {
        Ok(p) => p,
        Err(e) => {
            return Forwarded::Disconnected {
                delivered: false,
                reason: e.to_string(),
            };
        }
    };
    if let Err(e) = pubsub.subscribe(channel).await {
        return Forwarded::Disconnected {
            delivered: false,
            reason: e.to_string(),
        };
    }
    info!(channel = %channel, "subscribed to bus channel");

    let mut delivered = false;
    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                debug!(channel = %channel, error = %e, "skipping non-text bus payload");
                continue;
            }
        };
        if tx.send(payload).is_err() {
            return Forwarded::ReceiverGone;
        }
        delivered = true;
    }

    Forwarded::Disconnected {
        delivered,
        reason: "message stream ended".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisPubSubBus::new("not a url", "candidate_upload_queue").unwrap_err();
        assert!(matches!(err, BusError::Connection(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn publish_reaches_subscriber() {
        // Requires a live Redis: `REDIS_URL=... cargo test --features redis -- --ignored`.
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let bus = RedisPubSubBus::new(&url, "hireloop_test_channel").unwrap();
        let mut sub = bus.subscribe().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        bus.publish(r#"{"type":"queue","data":[]}"#.to_string())
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(r#"{"type":"queue","data":[]}"#));
    }
}
