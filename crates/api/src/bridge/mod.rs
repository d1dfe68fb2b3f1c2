//! Fan-out bridge: one per process, relays bus messages to local sockets.

pub mod origin;
pub mod registry;

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hireloop_events::{BusError, EventBus, Subscription};

pub use origin::{OriginPolicy, PolicyViolation};
pub use registry::{BroadcastReport, ConnectionError, ConnectionId, ConnectionRegistry, Outbound};

/// Normal closure, sent to every socket on shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Origin rejected.
pub const CLOSE_POLICY: u16 = 1008;
/// Server could not serve the connection (snapshot read failed).
pub const CLOSE_INTERNAL: u16 = 1011;
/// Server is going away and takes no new connections.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection fell behind and was dropped from the registry.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Running bridge. Dropping it without `shutdown` aborts the relay.
#[derive(Debug)]
pub struct FanoutBridge {
    registry: Arc<ConnectionRegistry>,
    stop: Option<oneshot::Sender<()>>,
    relay: JoinHandle<()>,
}

impl FanoutBridge {
    /// Subscribe to the bus and start relaying into `registry`.
    pub async fn start<B>(bus: &B, registry: Arc<ConnectionRegistry>) -> Result<Self, BusError>
    where
        B: EventBus<String> + ?Sized,
    {
        let subscription = bus.subscribe().await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let relay = tokio::spawn(relay(subscription, registry.clone(), stop_rx));
        info!("fan-out bridge subscribed");

        Ok(Self {
            registry,
            stop: Some(stop_tx),
            relay,
        })
    }

    /// Unsubscribe from the bus, then close every local socket normally.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.relay).await {
            warn!(error = %e, "bridge relay ended abnormally");
        }
        let closed = self.registry.close_all(CLOSE_NORMAL, "server shutting down");
        info!(closed, "fan-out bridge stopped");
    }
}

impl Drop for FanoutBridge {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay(
    mut subscription: Subscription<String>,
    registry: Arc<ConnectionRegistry>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            message = subscription.recv() => {
                let Some(payload) = message else {
                    warn!("bus subscription ended; live updates stopped");
                    break;
                };
                let report = registry.broadcast(Arc::from(payload));
                if !report.removed.is_empty() {
                    warn!(
                        delivered = report.delivered,
                        removed = report.removed.len(),
                        "dropped connections during broadcast"
                    );
                } else {
                    debug!(delivered = report.delivered, "bus message relayed");
                }
            }
        }
    }
    subscription.close();
}
