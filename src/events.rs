//! Live-update event hub.
//!
//! A single owner task holds the subscriber map and is driven through
//! three mailboxes (register, unregister, broadcast) multiplexed on one
//! command channel. Subscribers receive events over bounded queues; a
//! subscriber whose queue is full is dropped and unregistered rather than
//! ever blocking the broadcaster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 16;
/// Depth of the hub's own command mailbox.
const COMMAND_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A live-update message. Serializes to the tagged wire shape
/// `{"type": "stats" | "recent", "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Stats(StatsSnapshot),
    Recent(RecentRequest),
}

/// Aggregate counters shown on the admin dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Requests served since process start.
    pub total_requests: i64,
    /// Formatted hit percentage over the retained request log.
    pub cache_hit_rate: String,
    /// Requests logged today.
    pub today: i64,
    /// Non-revoked donated tokens.
    pub active_tokens: i64,
}

/// One proxied request, as shown in the live feed.
#[derive(Debug, Clone, Serialize)]
pub struct RecentRequest {
    pub method: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub display: String,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

enum Command {
    Register {
        id: u64,
        sender: mpsc::Sender<Event>,
    },
    Unregister {
        id: u64,
    },
    Broadcast(Event),
}

/// Handle to the hub task. Cheap to clone; the task stops when every
/// handle is gone.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
}

/// A registered subscriber. Unregisters itself on drop.
pub struct Subscription {
    id: u64,
    commands: mpsc::Sender<Command>,
    pub receiver: mpsc::Receiver<Event>,
}

impl EventHub {
    /// Spawn the owner task and return a handle to it.
    pub fn spawn() -> Self {
        let (commands, mut inbox) = mpsc::channel::<Command>(COMMAND_QUEUE);

        tokio::spawn(async move {
            let mut subscribers: HashMap<u64, mpsc::Sender<Event>> = HashMap::new();
            while let Some(command) = inbox.recv().await {
                match command {
                    Command::Register { id, sender } => {
                        subscribers.insert(id, sender);
                    }
                    Command::Unregister { id } => {
                        subscribers.remove(&id);
                    }
                    Command::Broadcast(event) => {
                        subscribers.retain(|id, sender| {
                            match sender.try_send(event.clone()) {
                                Ok(()) => true,
                                Err(_) => {
                                    debug!(subscriber = *id, "dropping slow event subscriber");
                                    false
                                }
                            }
                        });
                    }
                }
            }
        });

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new subscriber with a bounded queue.
    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        let _ = self
            .commands
            .send(Command::Register { id, sender })
            .await;
        Subscription {
            id,
            commands: self.commands.clone(),
            receiver,
        }
    }

    /// Fan an event out to all current subscribers. Never blocks the
    /// caller; if the hub's own mailbox is full the event is dropped.
    pub fn broadcast(&self, event: Event) {
        if self.commands.try_send(Command::Broadcast(event)).is_err() {
            debug!("event hub mailbox full; dropping broadcast");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Unregister { id: self.id });
    }
}
