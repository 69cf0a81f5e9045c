use std::sync::Arc;
use std::time::Duration;

use relaydesk_core::bus::{EventBus, EventEnvelope};
use relaydesk_coordination::CoordinationStore;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Coordination pub/sub channel carrying event envelopes between instances.
pub const EVENTS_CHANNEL: &str = "relaydesk:events";

/// Mirror locally-produced events to the coordination store and re-publish
/// foreign ones locally, so every connected agent sees the same stream no
/// matter which instance owns their socket. Origin ids stop echo loops.
pub fn start_event_bridge(
    bus: Arc<EventBus>,
    coordination: Arc<dyn CoordinationStore>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let outbound = {
        let bus = bus.clone();
        let coordination = coordination.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        // Only mirror what this instance produced; foreign
                        // envelopes were already on the wire.
                        if envelope.origin != bus.instance_id() {
                            continue;
                        }
                        let payload = match serde_json::to_string(&envelope) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize event envelope");
                                continue;
                            }
                        };
                        if let Err(e) = coordination.publish(EVENTS_CHANNEL, &payload).await {
                            warn!(error = %e, "event mirror publish failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bridge lagged behind local bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let inbound = tokio::spawn(async move {
        loop {
            let mut rx = match coordination.subscribe(EVENTS_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "event bridge subscribe failed, retrying");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            info!("event bridge subscribed");

            while let Some(payload) = rx.recv().await {
                match serde_json::from_str::<EventEnvelope>(&payload) {
                    Ok(envelope) => {
                        debug!(event = envelope.event.name(), "forwarding foreign event");
                        bus.publish_remote(envelope);
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable event envelope"),
                }
            }

            warn!("event bridge subscription closed, resubscribing");
            sleep(Duration::from_secs(1)).await;
        }
    });

    (outbound, inbound)
}
