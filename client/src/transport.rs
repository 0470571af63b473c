//! Client side of the relay: token handshake, channel attach, and the
//! publish/presence operations the session driver needs.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::protocol::GameMessage;
use shared::{Packet, PresenceAction, PresenceMember, PROTOCOL_VERSION};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RECV_BUFFER: usize = 65536;

/// Consecutive receive errors before the link is reported closed
const MAX_RECV_ERRORS: u32 = 50;
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum TransportError {
    InvalidAddress(String),
    Io(std::io::Error),
    Codec(bincode::Error),
    /// The relay did not answer a handshake step in time.
    Timeout(&'static str),
    /// The relay answered with a `Disconnected`.
    Refused(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidAddress(addr) => write!(f, "Invalid relay address: {}", addr),
            TransportError::Io(e) => write!(f, "Socket error: {}", e),
            TransportError::Codec(e) => write!(f, "Packet encoding error: {}", e),
            TransportError::Timeout(step) => write!(f, "Relay did not answer {}", step),
            TransportError::Refused(reason) => write!(f, "Relay refused connection: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Codec(e)
    }
}

/// What the receiver task hands to the session loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded game message and the relay-level id of whoever published it.
    Message { sender: String, message: GameMessage },
    Presence {
        action: PresenceAction,
        member: PresenceMember,
    },
    Members(Vec<PresenceMember>),
    Closed { reason: String },
}

pub struct RelayLink {
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    channel: String,
    client_id: String,
    receiver: JoinHandle<()>,
}

impl RelayLink {
    /// Requests a token, attaches to `channel`, and starts the receiver task.
    pub async fn connect(
        relay_addr: &str,
        channel: &str,
        client_id: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let relay_addr: SocketAddr = relay_addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(relay_addr.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        info!("Connecting to relay at {}", relay_addr);

        send_to(
            &socket,
            relay_addr,
            &Packet::TokenRequest {
                client_version: PROTOCOL_VERSION,
                client_id: Some(client_id.to_string()),
            },
        )
        .await?;

        let token = loop {
            match await_reply(&socket, relay_addr, timeout, "the token request").await? {
                Packet::TokenGranted {
                    token, capability, ..
                } => {
                    debug!("Token granted with capability {}", capability);
                    break token;
                }
                Packet::Disconnected { reason } => return Err(TransportError::Refused(reason)),
                other => debug!("Ignoring {:?} while waiting for a token", other),
            }
        };

        send_to(
            &socket,
            relay_addr,
            &Packet::Attach {
                token,
                channel: channel.to_string(),
            },
        )
        .await?;

        let client_id = loop {
            match await_reply(&socket, relay_addr, timeout, "the attach").await? {
                Packet::Attached { client_id, .. } => break client_id,
                Packet::Disconnected { reason } => return Err(TransportError::Refused(reason)),
                other => debug!("Ignoring {:?} while waiting to attach", other),
            }
        };
        info!("Attached to {} as {}", channel, client_id);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            relay_addr,
            channel.to_string(),
            tx,
        ));

        Ok((
            Self {
                socket,
                relay_addr,
                channel: channel.to_string(),
                client_id,
                receiver,
            },
            rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, packet: Packet) {
        if let Err(e) = send_to(&self.socket, self.relay_addr, &packet).await {
            error!("Failed to send to relay: {}", e);
        }
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) {
        self.send(Packet::Publish {
            topic: topic.to_string(),
            data,
        })
        .await;
    }

    pub async fn presence_enter(&self, data: Vec<u8>) {
        self.send(Packet::PresenceEnter { data }).await;
    }

    pub async fn presence_update(&self, data: Vec<u8>) {
        self.send(Packet::PresenceUpdate { data }).await;
    }

    pub async fn presence_leave(&self) {
        self.send(Packet::PresenceLeave).await;
    }

    pub async fn request_members(&self) {
        self.send(Packet::PresenceGet).await;
    }

    pub async fn heartbeat(&self) {
        self.send(Packet::Heartbeat).await;
    }

    /// Leaves presence and detaches so peers drop us right away instead of
    /// waiting for the relay timeout.
    pub async fn close(self) {
        self.presence_leave().await;
        self.send(Packet::Detach).await;
        info!("Detached from {}", self.channel);
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn send_to(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> Result<(), TransportError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Waits up to `timeout` for the next handshake reply from the relay.
async fn await_reply(
    socket: &UdpSocket,
    relay_addr: SocketAddr,
    timeout: Duration,
    step: &'static str,
) -> Result<Packet, TransportError> {
    tokio::time::timeout(timeout, next_reply(socket, relay_addr))
        .await
        .map_err(|_| TransportError::Timeout(step))?
}

async fn next_reply(socket: &UdpSocket, relay_addr: SocketAddr) -> Result<Packet, TransportError> {
    let mut buffer = vec![0u8; RECV_BUFFER];
    loop {
        let (len, from) = socket.recv_from(&mut buffer).await?;
        if from != relay_addr {
            continue;
        }
        match deserialize::<Packet>(&buffer[..len]) {
            Ok(
                packet @ (Packet::TokenGranted { .. }
                | Packet::Attached { .. }
                | Packet::Disconnected { .. }),
            ) => return Ok(packet),
            Ok(other) => debug!("Ignoring {:?} during handshake", other),
            Err(e) => warn!("Undecodable packet during handshake: {}", e),
        }
    }
}

/// Receive errors in a row; a persistent socket error must not spin forever.
#[derive(Debug, Default)]
struct ErrorStreak {
    count: u32,
}

impl ErrorStreak {
    /// Records an error. Returns true once the streak is long enough to give up.
    fn failed(&mut self) -> bool {
        self.count += 1;
        self.count >= MAX_RECV_ERRORS
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    channel: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buffer = vec![0u8; RECV_BUFFER];
    let mut errors = ErrorStreak::default();

    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => {
                errors.reset();
                received
            }
            Err(e) => {
                if errors.failed() {
                    error!("Giving up on relay after {} receive errors: {}", errors.count, e);
                    let _ = events.send(TransportEvent::Closed {
                        reason: format!("Relay unreachable: {}", e),
                    });
                    return;
                }
                debug!("Error receiving from relay: {}", e);
                tokio::time::sleep(RECV_ERROR_PAUSE).await;
                continue;
            }
        };
        if from != relay_addr {
            continue;
        }

        let packet = match deserialize::<Packet>(&buffer[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping undecodable packet from relay: {}", e);
                continue;
            }
        };

        let event = match packet {
            Packet::Message {
                channel: on,
                topic,
                client_id,
                data,
            } if on == channel => match GameMessage::decode(&topic, &data) {
                Some(message) => TransportEvent::Message {
                    sender: client_id,
                    message,
                },
                None => {
                    debug!("Discarding malformed {} message from {}", topic, client_id);
                    continue;
                }
            },
            Packet::Presence {
                channel: on,
                action,
                member,
            } if on == channel => TransportEvent::Presence { action, member },
            Packet::PresenceMembers {
                channel: on,
                members,
            } if on == channel => TransportEvent::Members(members),
            Packet::Disconnected { reason } => {
                warn!("Relay closed the connection: {}", reason);
                let _ = events.send(TransportEvent::Closed { reason });
                return;
            }
            other => {
                debug!("Ignoring unexpected packet {:?}", other);
                continue;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}
