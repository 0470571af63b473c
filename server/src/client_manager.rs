//! Connection and presence bookkeeping for the relay
//!
//! This module tracks every attached connection:
//! - Connection lifecycle (attach, detach, timeout)
//! - Which channel each connection publishes and subscribes on
//! - The presence record a connection has entered, if any
//! - Capacity limits and address lookup for fan-out
//!
//! The relay never looks inside presence data; it only stores the latest
//! bytes each member entered with and hands them back on query.

use log::info;
use shared::PresenceMember;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Connections silent for longer than this are dropped
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// An attached connection
#[derive(Debug)]
pub struct Client {
    /// Relay-assigned connection number
    pub id: u32,
    /// Client id carried by the token the connection attached with
    pub client_id: String,
    /// Channel the connection is attached to
    pub channel: String,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this connection
    pub last_seen: Instant,
    /// Presence data, present once the connection has entered
    pub presence: Option<Vec<u8>>,
}

impl Client {
    pub fn new(id: u32, client_id: String, channel: String, addr: SocketAddr) -> Self {
        Self {
            id,
            client_id,
            channel,
            addr,
            last_seen: Instant::now(),
            presence: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing has arrived from this connection within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn presence_member(&self) -> Option<PresenceMember> {
        self.presence.as_ref().map(|data| PresenceMember {
            client_id: self.client_id.clone(),
            data: data.clone(),
        })
    }
}

/// Manages all attached connections across channels
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attaches a connection. Returns None if the relay is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr, client_id: &str, channel: &str) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let id = self.allocate_id();

        info!(
            "Connection {} ({}) attached to {} from {}",
            id, client_id, channel, addr
        );
        self.clients.insert(
            id,
            Client::new(id, client_id.to_string(), channel.to_string(), addr),
        );

        Some(id)
    }

    /// Next free connection number, wrapping around and skipping live ones.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes a connection, handing back its record so callers can announce the leave.
    pub fn remove_client(&mut self, id: &u32) -> Option<Client> {
        let removed = self.clients.remove(id);
        if let Some(client) = &removed {
            info!("Connection {} ({}) detached", client.id, client.client_id);
        }
        removed
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, id: &u32) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Refreshes liveness. Returns false for unknown connections.
    pub fn touch(&mut self, id: u32) -> bool {
        if let Some(client) = self.clients.get_mut(&id) {
            client.touch();
            true
        } else {
            false
        }
    }

    /// Stores (or clears, with None) the presence data of a connection.
    pub fn set_presence(&mut self, id: u32, data: Option<Vec<u8>>) -> bool {
        if let Some(client) = self.clients.get_mut(&id) {
            client.presence = data;
            true
        } else {
            false
        }
    }

    /// Current presence roster of a channel, ordered by connection number
    pub fn members(&self, channel: &str) -> Vec<PresenceMember> {
        let mut entered: Vec<&Client> = self
            .clients
            .values()
            .filter(|client| client.channel == channel && client.presence.is_some())
            .collect();
        entered.sort_by_key(|client| client.id);

        entered
            .into_iter()
            .filter_map(|client| client.presence_member())
            .collect()
    }

    /// Addresses of every connection attached to a channel
    pub fn channel_addrs(&self, channel: &str) -> Vec<(u32, SocketAddr)> {
        self.clients
            .values()
            .filter(|client| client.channel == channel)
            .map(|client| (client.id, client.addr))
            .collect()
    }

    /// Removes connections that went silent and returns them
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(CLIENT_TIMEOUT))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
