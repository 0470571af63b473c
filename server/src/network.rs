//! Relay network layer: UDP packet handling, channel fan-out and presence

use crate::auth::TokenIssuer;
use crate::client_manager::{Client, ClientManager};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PresenceAction, PresenceMember, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

const RECV_BUFFER_SIZE: usize = 65_536;

/// Reason sent to addresses whose connection is gone
pub const NOT_ATTACHED: &str = "Not attached";

/// Messages sent from network tasks to the main relay loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client: Client,
    },
}

/// Messages sent from the relay loop to the sender task
#[derive(Debug)]
pub enum RelayMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    ChannelBroadcast { packet: Packet, channel: String },
}

/// Topic relay with presence, one UDP socket for every channel
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    auth: TokenIssuer,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    relay_tx: mpsc::UnboundedSender<RelayMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        capability: &str,
        token_ttl: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Relay listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            auth: TokenIssuer::new(capability, token_ttl),
            server_tx,
            server_rx,
            relay_tx,
            relay_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable from a vanished peer surfaces here on some platforms
                        debug!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut relay_rx = std::mem::replace(&mut self.relay_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = relay_rx.recv().await {
                match message {
                    RelayMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    RelayMessage::ChannelBroadcast { packet, channel } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.channel_addrs(&channel)
                        };

                        for (client_id, addr) in client_addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to connection {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors connection timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.relay_tx.send(RelayMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Sends to every connection on the channel, the publisher included
    fn broadcast_packet(&self, packet: Packet, channel: &str) {
        if let Err(e) = self.relay_tx.send(RelayMessage::ChannelBroadcast {
            packet,
            channel: channel.to_string(),
        }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    fn broadcast_presence(&self, channel: &str, action: PresenceAction, member: PresenceMember) {
        let packet = Packet::Presence {
            channel: channel.to_string(),
            action,
            member,
        };
        self.broadcast_packet(packet, channel);
    }

    /// Tells an address we hold no connection for that it has to attach again
    fn refuse_unattached(&self, addr: SocketAddr, what: &str) {
        debug!("{} from unattached address {}", what, addr);
        self.send_packet(
            Packet::Disconnected {
                reason: NOT_ATTACHED.to_string(),
            },
            addr,
        );
    }

    /// Announces a leave for a removed connection that had entered presence
    fn announce_departure(&self, client: &Client) {
        if let Some(member) = client.presence_member() {
            self.broadcast_presence(&client.channel, PresenceAction::Leave, member);
        }
    }

    /// Looks up the attached connection for an address and refreshes its liveness
    async fn attached_client(&self, addr: SocketAddr) -> Option<(u32, String, String)> {
        let mut clients = self.clients.write().await;
        let id = clients.find_client_by_addr(addr)?;
        clients.touch(id);
        clients
            .get(&id)
            .map(|client| (id, client.client_id.clone(), client.channel.clone()))
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::TokenRequest {
                client_version,
                client_id,
            } => {
                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Rejecting token request from {} (version {})",
                        addr, client_version
                    );
                    let reason = format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, client_version
                    );
                    self.send_packet(Packet::Disconnected { reason }, addr);
                    return;
                }

                let grant = self.auth.issue(client_id);
                self.send_packet(
                    Packet::TokenGranted {
                        token: grant.token,
                        client_id: grant.client_id,
                        capability: grant.capability,
                        expires_at: grant.expires_at,
                    },
                    addr,
                );
            }

            Packet::Attach { token, channel } => {
                let client_id = match self.auth.verify(&token, &channel) {
                    Ok(client_id) => client_id,
                    Err(e) => {
                        warn!("Attach from {} refused: {}", addr, e);
                        self.send_packet(
                            Packet::Disconnected {
                                reason: e.to_string(),
                            },
                            addr,
                        );
                        return;
                    }
                };

                // A re-attach from the same address replaces the old connection
                let replaced = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|existing| clients.remove_client(&existing))
                };
                if let Some(old) = replaced {
                    info!("Replacing connection {} from {}", old.id, addr);
                    self.announce_departure(&old);
                }

                let added = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr, &client_id, &channel)
                };

                let response = match added {
                    Some(_) => Packet::Attached { channel, client_id },
                    None => Packet::Disconnected {
                        reason: "Relay full".to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::Publish { topic, data } => {
                let Some((_, client_id, channel)) = self.attached_client(addr).await else {
                    self.refuse_unattached(addr, "Publish");
                    return;
                };

                let packet = Packet::Message {
                    channel: channel.clone(),
                    topic,
                    client_id,
                    data,
                };
                self.broadcast_packet(packet, &channel);
            }

            Packet::PresenceEnter { data } | Packet::PresenceUpdate { data } => {
                let Some((id, client_id, channel)) = self.attached_client(addr).await else {
                    self.refuse_unattached(addr, "Presence change");
                    return;
                };

                let was_present = {
                    let mut clients = self.clients.write().await;
                    let was_present = clients
                        .get(&id)
                        .map(|client| client.presence.is_some())
                        .unwrap_or(false);
                    clients.set_presence(id, Some(data.clone()));
                    was_present
                };

                let action = if was_present {
                    PresenceAction::Update
                } else {
                    PresenceAction::Enter
                };
                debug!("Presence {:?} for {} on {}", action, client_id, channel);
                self.broadcast_presence(&channel, action, PresenceMember { client_id, data });
            }

            Packet::PresenceLeave => {
                let Some((id, client_id, channel)) = self.attached_client(addr).await else {
                    self.refuse_unattached(addr, "Presence leave");
                    return;
                };

                let previous = {
                    let mut clients = self.clients.write().await;
                    let previous = clients.get(&id).and_then(|client| client.presence.clone());
                    clients.set_presence(id, None);
                    previous
                };

                if let Some(data) = previous {
                    debug!("Presence leave for {} on {}", client_id, channel);
                    self.broadcast_presence(
                        &channel,
                        PresenceAction::Leave,
                        PresenceMember { client_id, data },
                    );
                }
            }

            Packet::PresenceGet => {
                let Some((_, _, channel)) = self.attached_client(addr).await else {
                    self.refuse_unattached(addr, "Member query");
                    return;
                };

                let members = {
                    let clients = self.clients.read().await;
                    clients.members(&channel)
                };
                self.send_packet(Packet::PresenceMembers { channel, members }, addr);
            }

            Packet::Heartbeat => {
                if self.attached_client(addr).await.is_none() {
                    self.refuse_unattached(addr, "Heartbeat");
                }
            }

            Packet::Detach => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|id| clients.remove_client(&id))
                };

                if let Some(client) = removed {
                    self.announce_departure(&client);
                }
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    /// Main relay loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut maintenance = interval(Duration::from_secs(60));

        info!("Relay started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client }) => {
                            info!("Connection {} ({}) timed out", client.id, client.client_id);
                            self.announce_departure(&client);
                        },
                        None => {
                            info!("Relay shutting down");
                            break;
                        }
                    }
                },

                _ = maintenance.tick() => {
                    self.auth.prune_expired();
                    let clients = self.clients.read().await;
                    if clients.is_empty() && self.auth.is_empty() {
                        debug!("Relay idle");
                    } else {
                        debug!("{} connections, {} live tokens", clients.len(), self.auth.len());
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_server() -> Server {
        Server::new("127.0.0.1:0", 4, "bird-*", Duration::from_secs(60))
            .await
            .unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn next_relay_message(server: &mut Server) -> RelayMessage {
        server.relay_rx.try_recv().expect("expected a queued relay message")
    }

    async fn attach(server: &mut Server, client_id: &str, from: SocketAddr) {
        server
            .handle_packet(
                Packet::TokenRequest {
                    client_version: PROTOCOL_VERSION,
                    client_id: Some(client_id.to_string()),
                },
                from,
            )
            .await;
        let token = match next_relay_message(server) {
            RelayMessage::SendPacket {
                packet: Packet::TokenGranted { token, .. },
                ..
            } => token,
            other => panic!("Unexpected message: {:?}", other),
        };

        server
            .handle_packet(
                Packet::Attach {
                    token,
                    channel: "bird-garden".to_string(),
                },
                from,
            )
            .await;
        match next_relay_message(server) {
            RelayMessage::SendPacket {
                packet: Packet::Attached { client_id: id, .. },
                addr: a,
            } => {
                assert_eq!(id, client_id);
                assert_eq!(a, from);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_bad_bind_address() {
        let result = tokio_test::block_on(Server::new("not-an-address", 4, "*", Duration::from_secs(60)));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_token_request_version_mismatch() {
        let mut server = test_server().await;
        server
            .handle_packet(
                Packet::TokenRequest {
                    client_version: 99,
                    client_id: None,
                },
                addr(5000),
            )
            .await;

        match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::Disconnected { reason },
                ..
            } => assert!(reason.contains("version")),
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_with_bad_token_is_refused() {
        let mut server = test_server().await;
        server
            .handle_packet(
                Packet::Attach {
                    token: "nope".to_string(),
                    channel: "bird-garden".to_string(),
                },
                addr(5000),
            )
            .await;

        match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::Disconnected { reason },
                ..
            } => assert_eq!(reason, "Unknown token"),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(server.clients.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_attach_outside_capability_is_refused() {
        let mut server = test_server().await;
        server
            .handle_packet(
                Packet::TokenRequest {
                    client_version: PROTOCOL_VERSION,
                    client_id: None,
                },
                addr(5000),
            )
            .await;
        let token = match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::TokenGranted { token, .. },
                ..
            } => token,
            other => panic!("Unexpected message: {:?}", other),
        };

        server
            .handle_packet(
                Packet::Attach {
                    token,
                    channel: "fish-pond".to_string(),
                },
                addr(5000),
            )
            .await;
        assert!(matches!(
            next_relay_message(&mut server),
            RelayMessage::SendPacket {
                packet: Packet::Disconnected { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_publish_is_echoed_to_whole_channel() {
        let mut server = test_server().await;
        attach(&mut server, "p1", addr(5001)).await;

        server
            .handle_packet(
                Packet::Publish {
                    topic: "fire".to_string(),
                    data: b"{}".to_vec(),
                },
                addr(5001),
            )
            .await;

        match next_relay_message(&mut server) {
            RelayMessage::ChannelBroadcast {
                packet:
                    Packet::Message {
                        topic, client_id, ..
                    },
                channel,
            } => {
                assert_eq!(topic, "fire");
                assert_eq!(client_id, "p1");
                assert_eq!(channel, "bird-garden");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    fn assert_not_attached(server: &mut Server, to: SocketAddr) {
        match next_relay_message(server) {
            RelayMessage::SendPacket {
                packet: Packet::Disconnected { reason },
                addr: a,
            } => {
                assert_eq!(reason, NOT_ATTACHED);
                assert_eq!(a, to);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(server.relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_from_unattached_address_is_refused() {
        let mut server = test_server().await;
        server
            .handle_packet(
                Packet::Publish {
                    topic: "state".to_string(),
                    data: Vec::new(),
                },
                addr(5002),
            )
            .await;
        assert_not_attached(&mut server, addr(5002));
    }

    #[tokio::test]
    async fn test_timed_out_connection_is_told_to_attach_again() {
        let mut server = test_server().await;
        attach(&mut server, "p1", addr(5001)).await;
        server
            .handle_packet(Packet::PresenceEnter { data: b"a".to_vec() }, addr(5001))
            .await;
        let _ = next_relay_message(&mut server);

        let expired = {
            let mut clients = server.clients.write().await;
            let id = clients.find_client_by_addr(addr(5001)).unwrap();
            clients.remove_client(&id).unwrap()
        };
        server.announce_departure(&expired);
        let _ = next_relay_message(&mut server);

        for packet in [
            Packet::Heartbeat,
            Packet::PresenceGet,
            Packet::PresenceEnter { data: b"a".to_vec() },
            Packet::PresenceLeave,
        ] {
            server.handle_packet(packet, addr(5001)).await;
            assert_not_attached(&mut server, addr(5001));
        }

        // Detach from a stranger needs no answer
        server.handle_packet(Packet::Detach, addr(5001)).await;
        assert!(server.relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_enter_update_leave() {
        let mut server = test_server().await;
        attach(&mut server, "p1", addr(5001)).await;

        server
            .handle_packet(Packet::PresenceEnter { data: b"a".to_vec() }, addr(5001))
            .await;
        assert!(matches!(
            next_relay_message(&mut server),
            RelayMessage::ChannelBroadcast {
                packet: Packet::Presence {
                    action: PresenceAction::Enter,
                    ..
                },
                ..
            }
        ));

        server
            .handle_packet(Packet::PresenceUpdate { data: b"b".to_vec() }, addr(5001))
            .await;
        assert!(matches!(
            next_relay_message(&mut server),
            RelayMessage::ChannelBroadcast {
                packet: Packet::Presence {
                    action: PresenceAction::Update,
                    ..
                },
                ..
            }
        ));

        server.handle_packet(Packet::PresenceGet, addr(5001)).await;
        match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::PresenceMembers { members, .. },
                ..
            } => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].data, b"b".to_vec());
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        server.handle_packet(Packet::PresenceLeave, addr(5001)).await;
        assert!(matches!(
            next_relay_message(&mut server),
            RelayMessage::ChannelBroadcast {
                packet: Packet::Presence {
                    action: PresenceAction::Leave,
                    ..
                },
                ..
            }
        ));

        // Leaving twice announces nothing
        server.handle_packet(Packet::PresenceLeave, addr(5001)).await;
        assert!(server.relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_announces_leave() {
        let mut server = test_server().await;
        attach(&mut server, "p1", addr(5001)).await;
        attach(&mut server, "p2", addr(5002)).await;

        server
            .handle_packet(Packet::PresenceEnter { data: b"a".to_vec() }, addr(5001))
            .await;
        let _ = next_relay_message(&mut server);

        server.handle_packet(Packet::Detach, addr(5001)).await;
        match next_relay_message(&mut server) {
            RelayMessage::ChannelBroadcast {
                packet:
                    Packet::Presence {
                        action: PresenceAction::Leave,
                        member,
                        ..
                    },
                ..
            } => assert_eq!(member.client_id, "p1"),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(server.clients.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_full() {
        let mut server = Server::new("127.0.0.1:0", 1, "*", Duration::from_secs(60))
            .await
            .unwrap();
        server
            .handle_packet(
                Packet::TokenRequest {
                    client_version: PROTOCOL_VERSION,
                    client_id: Some("p1".to_string()),
                },
                addr(5001),
            )
            .await;
        let first = match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::TokenGranted { token, .. },
                ..
            } => token,
            other => panic!("Unexpected message: {:?}", other),
        };
        server
            .handle_packet(
                Packet::Attach {
                    token: first.clone(),
                    channel: "room".to_string(),
                },
                addr(5001),
            )
            .await;
        let _ = next_relay_message(&mut server);

        server
            .handle_packet(
                Packet::Attach {
                    token: first,
                    channel: "room".to_string(),
                },
                addr(5002),
            )
            .await;
        match next_relay_message(&mut server) {
            RelayMessage::SendPacket {
                packet: Packet::Disconnected { reason },
                ..
            } => assert_eq!(reason, "Relay full"),
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
