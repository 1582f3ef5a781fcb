//! Event bus for engine operations
//!
//! Carries committed state changes and outgoing notifications to any
//! subscriber (delivery transports, cache invalidation, logging). Events are
//! emitted after the transaction that produced them commits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use super::audit::{NotificationDispatcher, NotificationKind, Recipient};
use crate::db::{RequestStatus, RequestType, SourceType};
use crate::error::EngineError;
use crate::money::Money;

/// Engine events emitted by services
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ReferralAttached {
        invitee_id: String,
        inviter_id: String,
        edges_written: usize,
    },
    BonusPaid {
        inviter_id: String,
        invitee_id: String,
        level: u8,
        amount: Money,
        source_type: SourceType,
        source_id: String,
    },
    RequestCreated {
        request_id: String,
        request_type: RequestType,
        user_id: String,
        assigned_admin_id: String,
    },
    RequestResolved {
        request_id: String,
        status: RequestStatus,
        admin_id: String,
    },
    PoolRefreshed {
        generation: u64,
        admin_ids: Vec<String>,
    },
    Notification {
        recipient: Recipient,
        kind: NotificationKind,
        payload: serde_json::Value,
    },
}

/// Event bus for broadcasting engine events
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Emitting engine event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications go out on the bus; a transport subscribes and delivers them
#[async_trait]
impl NotificationDispatcher for EventBus {
    async fn notify(
        &self,
        recipient: Recipient,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.emit(EngineEvent::Notification { recipient, kind, payload });
        Ok(())
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::BonusPaid { inviter_id, level, amount, source_id, .. } => {
            debug!(inviter = %inviter_id, bonus_level = *level, amount = %amount, source = %source_id, "Bonus paid");
        }
        EngineEvent::RequestCreated { request_id, assigned_admin_id, .. } => {
            debug!(request = %request_id, admin = %assigned_admin_id, "Request assigned");
        }
        EngineEvent::RequestResolved { request_id, status, admin_id } => {
            info!(request = %request_id, status = %status, admin = %admin_id, "Request resolved");
        }
        EngineEvent::PoolRefreshed { generation, admin_ids } => {
            info!(generation, admins = admin_ids.len(), "Admin pool refreshed");
        }
        _ => {
            trace!(event = ?event, "Engine event");
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
