//! In-process message fabric between the engine and validators.
//!
//! Every participant registers an endpoint and receives an unbounded queue.
//! The bus stamps the sender id on every envelope, so a participant cannot
//! impersonate another at the transport level.

use crate::message::ConsensusMessage;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

/// Endpoint id the engine registers under
pub const ENGINE_ENDPOINT: &str = "engine";

/// A message together with its authenticated sender
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    pub message: ConsensusMessage,
}

pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

/// Shared routing table
#[derive(Clone, Default)]
pub struct MessageBus {
    routes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its endpoint and receive queue.
    ///
    /// Registering an id again replaces the previous queue.
    pub fn register(&self, id: &str) -> (Endpoint, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        (
            Endpoint {
                id: id.to_string(),
                bus: self.clone(),
            },
            rx,
        )
    }

    pub fn unregister(&self, id: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn deliver(&self, from: &str, to: &str, message: ConsensusMessage) -> bool {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(to) {
            Some(tx) => tx
                .send(Envelope {
                    from: from.to_string(),
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    fn deliver_all(&self, from: &str, message: &ConsensusMessage) -> usize {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|(id, _)| id.as_str() != from)
            .filter(|(_, tx)| {
                tx.send(Envelope {
                    from: from.to_string(),
                    message: message.clone(),
                })
                .is_ok()
            })
            .count()
    }
}

/// A participant's handle on the bus
#[derive(Clone)]
pub struct Endpoint {
    id: String,
    bus: MessageBus,
}

impl Endpoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send to one participant. Returns false when `to` is unknown or gone.
    pub fn send(&self, to: &str, message: ConsensusMessage) -> bool {
        trace!(from = %self.id, to = %to, proposal_id = %message.proposal_id(), "send");
        self.bus.deliver(&self.id, to, message)
    }

    /// Send to every other participant and return the number reached
    pub fn broadcast(&self, message: ConsensusMessage) -> usize {
        trace!(from = %self.id, proposal_id = %message.proposal_id(), "broadcast");
        self.bus.deliver_all(&self.id, &message)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}
