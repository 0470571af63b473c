//! Attaches to a relay channel as a passive subscriber and prints what flows through it.

use bincode::{deserialize, serialize};
use clap::Parser;
use shared::protocol::{GameMessage, PresenceData};
use shared::{Packet, DEFAULT_CHANNEL, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    relay: String,

    /// Channel to attach to
    #[arg(short, long, default_value = DEFAULT_CHANNEL)]
    channel: String,

    /// How long to listen, in seconds
    #[arg(short, long, default_value = "30")]
    seconds: u64,
}

async fn send(
    socket: &UdpSocket,
    packet: &Packet,
    relay: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, relay).await?;
    Ok(())
}

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Result<Packet, Box<dyn std::error::Error>> {
    let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(buf)).await??;
    Ok(deserialize::<Packet>(&buf[0..len])?)
}

fn describe_member(client_id: &str, data: &[u8]) -> String {
    match PresenceData::decode(data) {
        Some(p) => format!(
            "{} name={} color={} hp={} score={}",
            client_id, p.name, p.color, p.hp, p.score
        ),
        None => format!("{} ({} bytes of unreadable presence data)", client_id, data.len()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);
    let relay = args.relay.parse::<SocketAddr>()?;

    let mut buf = vec![0u8; 65_536];

    send(
        &socket,
        &Packet::TokenRequest {
            client_version: PROTOCOL_VERSION,
            client_id: None,
        },
        relay,
    )
    .await?;

    let token = match recv(&socket, &mut buf).await? {
        Packet::TokenGranted {
            token,
            client_id,
            capability,
            ..
        } => {
            println!("Token granted to {} (capability {})", client_id, capability);
            token
        }
        other => {
            println!("Expected TokenGranted but got: {:?}", other);
            return Ok(());
        }
    };

    send(
        &socket,
        &Packet::Attach {
            token,
            channel: args.channel.clone(),
        },
        relay,
    )
    .await?;

    match recv(&socket, &mut buf).await? {
        Packet::Attached { channel, .. } => println!("Attached to {}", channel),
        other => {
            println!("Expected Attached but got: {:?}", other);
            return Ok(());
        }
    }

    send(&socket, &Packet::PresenceGet, relay).await?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut heartbeat = interval(Duration::from_secs(1));

    while Instant::now() < deadline {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, _) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        println!("Error receiving: {}", e);
                        sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                match deserialize::<Packet>(&buf[0..len]) {
                    Ok(Packet::Message { topic, client_id, data, .. }) => {
                        match GameMessage::decode(&topic, &data) {
                            Some(message) => println!("[{}] from {}: {:?}", topic, client_id, message),
                            None => println!("[{}] from {}: undecodable payload", topic, client_id),
                        }
                    }
                    Ok(Packet::Presence { action, member, .. }) => {
                        println!("presence {:?}: {}", action, describe_member(&member.client_id, &member.data));
                    }
                    Ok(Packet::PresenceMembers { members, .. }) => {
                        println!("{} members present", members.len());
                        for member in members {
                            println!("  {}", describe_member(&member.client_id, &member.data));
                        }
                    }
                    Ok(Packet::Disconnected { reason }) => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    Ok(other) => println!("Unexpected packet: {:?}", other),
                    Err(e) => println!("Failed to deserialize packet: {}", e),
                }
            }
            _ = heartbeat.tick() => {
                send(&socket, &Packet::Heartbeat, relay).await?;
            }
        }
    }

    send(&socket, &Packet::Detach, relay).await?;
    println!("Probe finished");

    Ok(())
}
