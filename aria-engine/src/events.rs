//! Event-client registry: who asked to hear about what.
//!
//! Clients register per event id; raising an event fans out one packet
//! per registered client. The registry is owned by the worker and never
//! shared across threads.

use std::collections::HashMap;

use aria_sync::{Error, Result};
use aria_wire::packet::{ClientId, Packet};

/// Outbound transport for packets headed to external clients.
///
/// The embedder decides what "send" means: a client response queue, a
/// transport stub in tests, a real IPC layer in production.
pub trait PacketSink: Send {
    fn send(&self, packet: Packet);
}

/// One registered client and its registration payload.
#[derive(Debug)]
pub struct EventClient {
    pub id: ClientId,
    /// Client-supplied registration config, freed with the entry.
    pub config: Option<Vec<u8>>,
}

/// Per-event lists of client descriptors.
#[derive(Debug, Default)]
pub struct EventRegistry {
    events: HashMap<u32, Vec<EventClient>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` for `event_id`. Re-registering the same identity
    /// is a no-op, matching the command path's idempotent retries.
    pub fn add_client(&mut self, event_id: u32, client: ClientId, config: Option<Vec<u8>>) {
        let clients = self.events.entry(event_id).or_default();
        if clients.iter().any(|c| c.id == client) {
            tracing::debug!(event_id = format_args!("{event_id:#x}"), "client already registered");
            return;
        }
        clients.push(EventClient { id: client, config });
    }

    pub fn delete_client(&mut self, event_id: u32, client: &ClientId) -> Result<()> {
        let clients = self.events.get_mut(&event_id).ok_or(Error::Failed)?;
        let before = clients.len();
        clients.retain(|c| c.id != *client);
        if clients.len() == before {
            tracing::error!(event_id = format_args!("{event_id:#x}"), "client not registered");
            return Err(Error::Failed);
        }
        Ok(())
    }

    pub fn clients(&self, event_id: u32) -> &[EventClient] {
        self.events.get(&event_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_clients(&self, event_id: u32) -> bool {
        !self.clients(event_id).is_empty()
    }

    pub fn delete_all(&mut self) {
        self.events.clear();
    }

    /// Fan `payload` out to every client of `event_id`.
    pub fn raise(&self, event_id: u32, payload: &[u8], sink: &dyn PacketSink) -> usize {
        let clients = self.clients(event_id);
        for client in clients {
            sink.send(Packet::new(event_id, 0, client.id, payload.to_vec()));
        }
        clients.len()
    }
}
