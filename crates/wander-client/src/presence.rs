//! Counterparty presence.
//!
//! The conversation store consumes presence through [`PresenceSource`], so a
//! real push channel and the simulated timer are interchangeable.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wander_types::events::PresenceUpdate;

use crate::conversations::ConversationStore;

pub trait PresenceSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate>;
}

/// Push feed: whatever receives presence from the server publishes here.
#[derive(Clone)]
pub struct PresenceFeed {
    tx: broadcast::Sender<PresenceUpdate>,
}

impl PresenceFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an update to all subscribers. Dropped if nobody listens.
    pub fn publish(&self, update: PresenceUpdate) {
        let _ = self.tx.send(update);
    }
}

impl Default for PresenceFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceSource for PresenceFeed {
    fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.tx.subscribe()
    }
}

/// Stand-in for a server feed: on every tick one random counterparty flips
/// between online and offline.
///
/// The timer stops when the given token is cancelled or the simulator is
/// dropped, whichever comes first.
pub struct SimulatedPresence {
    feed: PresenceFeed,
    stop: CancellationToken,
}

impl SimulatedPresence {
    /// `initial` maps conversation id to current online state.
    pub fn spawn(
        initial: HashMap<String, bool>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn_with_rng(initial, interval, cancel, StdRng::from_os_rng())
    }

    pub fn spawn_with_rng(
        mut online: HashMap<String, bool>,
        interval: Duration,
        cancel: CancellationToken,
        mut rng: StdRng,
    ) -> Self {
        let feed = PresenceFeed::new();
        let tx = feed.clone();
        let stop = cancel.child_token();
        let cancel = stop.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some((id, state)) = online.iter_mut().choose(&mut rng) else {
                    continue;
                };
                // Lean towards coming online so the simulation does not drift
                // to everyone offline.
                *state = if *state { rng.random_bool(0.5) } else { rng.random_bool(0.7) };

                tx.publish(PresenceUpdate {
                    conversation_id: id.clone(),
                    online: *state,
                    last_seen: (!*state).then(Utc::now),
                });
            }
            debug!("Simulated presence stopped");
        });

        Self { feed, stop }
    }
}

impl Drop for SimulatedPresence {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl PresenceSource for SimulatedPresence {
    fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.feed.subscribe()
    }
}

/// Apply updates from `source` to `store` until cancelled or the source
/// closes.
pub async fn run_presence_loop(
    store: ConversationStore,
    source: &dyn PresenceSource,
    cancel: CancellationToken,
) {
    let mut rx = source.subscribe();
    info!("Presence loop started");

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };

        match update {
            Ok(update) => {
                if !store.apply_presence(&update) {
                    debug!(conversation_id = %update.conversation_id, "Presence for unknown conversation");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Presence loop lagging, updates dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    info!("Presence loop stopped");
}
