//! # Bird Garden Relay
//!
//! A small topic relay with presence, standing in for a hosted realtime
//! pub/sub service. It knows nothing about the game: payloads are opaque
//! bytes, and every decision about health, score or hits is made by the
//! clients themselves.
//!
//! ## Responsibilities
//!
//! ### Token issuing
//! Hands out short-lived capability tokens bound to a client id. A token is
//! scoped to a channel pattern and checked once, on attach.
//!
//! ### Channel fan-out
//! A `Publish` from an attached connection is delivered as a `Message` to every
//! connection on the same channel, the publisher included. Clients must expect
//! to see their own publications come back.
//!
//! ### Presence
//! Each connection may enter presence with opaque data, update it, and leave.
//! Changes are broadcast to the channel, and the full roster can be queried at
//! any time. Connections that go silent are dropped and a leave is broadcast
//! on their behalf.
//!
//! ## Architecture
//!
//! The relay runs one event loop over a single UDP socket, with helper tasks:
//! - **Network Receiver**: decodes incoming datagrams into packets
//! - **Network Sender**: serializes outgoing packets and fans out broadcasts
//! - **Timeout Checker**: removes silent connections
//! - **Main Loop**: applies packets to the connection table in arrival order
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         64,
//!         "*",
//!         Duration::from_secs(3600),
//!     ).await?;
//!
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client_manager;
pub mod network;
