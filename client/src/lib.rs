//! # Bird Garden Client Library
//!
//! This library holds the client-side synchronization core for the bird
//! sandbox: every bird, projectile and world entity a player sees, and the
//! rules that keep those views consistent between peers that only talk to each
//! other through a publish/subscribe relay.
//!
//! ## Architecture Overview
//!
//! There is no authoritative game server. The relay forwards messages and
//! tracks who is in the room; every decision about the game is made by one of
//! the clients. Consistency comes from ownership rather than from a central
//! simulation:
//!
//! ### Self-Authority
//! Each client is the only writer of its own bird's health and score. Other
//! clients can tell it that it was hit, but only it decides what that does, and
//! it then announces the result as a full overwrite (`hp_update`, `respawn`).
//!
//! ### Owner-Side Hit Detection
//! Projectiles are simulated by every client, but only the client that fired a
//! projectile declares that it hit another bird. A per-client memory of
//! resolved projectile ids keeps a single shot from doing damage twice when the
//! target's own detection and the owner's announcement both arrive.
//!
//! ### Order Tolerance
//! The relay guarantees no ordering. Actor updates overwrite rather than add,
//! creation is idempotent, and unknown actors are created on first sighting, so
//! any interleaving of messages converges on the latest values.
//!
//! ### Roster Reconciliation
//! Presence events keep the room roster current, and a periodic full member
//! list pass removes any bird whose client left without saying goodbye.
//!
//! ## Module Organization
//!
//! - `identity`: session id, display name and colour.
//! - `actor`: the local bird, its movement, dash gauge and respawn state.
//! - `remote`: mirrors of the other birds in the room.
//! - `projectile`: the shared projectile registry and resolved-id memory.
//! - `world`: chickens, the rainbow chicken and hearts, laid out from a room seed.
//! - `arbitration`: per-tick verdicts on what each projectile touched.
//! - `game`: the session that owns all of the above and applies messages.
//! - `transport`: the UDP link to the relay.
//! - `network`: the driver task that feeds the session and flushes its outbox.
//! - `input` and `rendering`: the macroquad front end.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::SessionConfig;
//! use client::identity::Identity;
//! use client::network::{Command, LinkOptions, SessionDriver};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let identity = Identity::generate(&mut rand::thread_rng(), None, None);
//! let options = LinkOptions {
//!     relay: "127.0.0.1:8080".to_string(),
//!     channel: "bird-garden-3d-v2".to_string(),
//!     connect_timeout: Duration::from_secs(3),
//!     offline: false,
//! };
//!
//! let (driver, handle) = SessionDriver::start(identity, options, SessionConfig::default()).await;
//! tokio::spawn(driver.run());
//!
//! handle.send(Command::Fire);
//! let snapshot = handle.snapshot();
//! println!("{} birds in the room", snapshot.members);
//! # }
//! ```
//!
//! ## Failure Handling
//!
//! If the relay cannot be reached the session keeps running offline with no
//! remote birds. A panic inside a simulation step is caught, logged and shown
//! as a notice; the next step runs as usual.

pub mod actor;
pub mod arbitration;
pub mod game;
pub mod identity;
pub mod input;
pub mod network;
pub mod projectile;
pub mod remote;
pub mod rendering;
pub mod transport;
pub mod world;
