//! Session driver: the one task that owns the game session.
//!
//! Relay events, front-end commands and the periodic timers are multiplexed
//! with `tokio::select!`, so every mutation of the session happens here, one
//! handler at a time. Whatever a handler queues in the outbox is flushed to the
//! relay right after it returns, or dropped when playing offline.
//!
//! When the relay drops an established link the driver keeps simulating
//! offline and reattaches in the background, entering presence again once it
//! is back.

use crate::actor::Controls;
use crate::game::{Frame, GameSession, Outbound, RenderSnapshot, SessionConfig};
use crate::identity::Identity;
use crate::transport::{RelayLink, TransportEvent};
use log::{debug, error, info, warn};
use shared::timestamp_ms;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

type Connected = (RelayLink, mpsc::UnboundedReceiver<TransportEvent>);

/// Requests from the front end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Controls(Controls),
    Fire,
    Dash,
    /// Leave presence while the window is in the background.
    Suspend,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub relay: String,
    pub channel: String,
    pub connect_timeout: Duration,
    /// Skip the relay entirely.
    pub offline: bool,
}

/// The front end's side of a running driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<RenderSnapshot>,
}

impl DriverHandle {
    /// Returns false once the driver has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderSnapshot> {
        self.snapshots.clone()
    }
}

/// Background attempts to get back onto the relay, with exponential backoff.
/// Dropping it stops the attempts.
struct Reconnect(JoinHandle<Connected>);

impl Reconnect {
    fn spawn(options: LinkOptions, client_id: String, first_delay: Duration, max_delay: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut delay = first_delay;
            let mut attempt = 1u32;
            loop {
                tokio::time::sleep(delay).await;
                match RelayLink::connect(
                    &options.relay,
                    &options.channel,
                    &client_id,
                    options.connect_timeout,
                )
                .await
                {
                    Ok(connected) => return connected,
                    Err(e) => {
                        debug!("Reconnect attempt {} failed: {}", attempt, e);
                        attempt += 1;
                        delay = (delay * 2).min(max_delay);
                    }
                }
            }
        }))
    }
}

impl Drop for Reconnect {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SessionDriver {
    session: GameSession,
    options: LinkOptions,
    link: Option<RelayLink>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    reconnect: Option<Reconnect>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<RenderSnapshot>,
    suspended: bool,
    last_tick: Instant,
}

impl SessionDriver {
    /// Builds the session and tries to reach the relay. A failed connection
    /// leaves the driver playing offline.
    pub async fn start(
        identity: Identity,
        options: LinkOptions,
        config: SessionConfig,
    ) -> (Self, DriverHandle) {
        let mut session = GameSession::new(identity, &options.channel, config, timestamp_ms() as f64);

        let (link, events) = if options.offline {
            info!("Starting offline");
            session.set_notice("Playing offline");
            (None, None)
        } else {
            match RelayLink::connect(
                &options.relay,
                &options.channel,
                session.local_id(),
                options.connect_timeout,
            )
            .await
            {
                Ok((link, events)) => (Some(link), Some(events)),
                Err(e) => {
                    warn!("Could not reach relay {}: {}", options.relay, e);
                    session.set_notice(format!("Offline: {}", e));
                    (None, None)
                }
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        let mut driver = Self {
            session,
            options,
            link,
            events,
            reconnect: None,
            commands: command_rx,
            snapshots: snapshot_tx,
            suspended: false,
            last_tick: Instant::now(),
        };

        if driver.link.is_some() {
            driver.session.set_online(true);
            driver.enter_presence().await;
        }
        driver.publish_snapshot();

        let handle = DriverHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        (driver, handle)
    }

    pub fn is_online(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    /// Runs until a `Shutdown` command arrives or every handle is dropped.
    pub async fn run(mut self) {
        let config = self.session.config().clone();

        let mut tick = interval(config.tick_interval);
        let mut state = interval(config.state_interval);
        let mut presence = interval(config.presence_interval);
        let mut heartbeat = interval(config.heartbeat_interval);
        for timer in [&mut tick, &mut state, &mut presence, &mut heartbeat] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        self.last_tick = Instant::now();

        loop {
            tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.link_lost("Relay connection lost"),
                },

                connected = next_reconnect(&mut self.reconnect) => self.relink(connected).await,

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                _ = tick.tick() => {
                    if !self.suspended {
                        self.run_tick();
                    }
                },

                _ = state.tick() => {
                    if !self.suspended {
                        self.session.queue_state();
                    }
                },

                _ = presence.tick() => {
                    if let Some(link) = &self.link {
                        link.request_members().await;
                    }
                },

                _ = heartbeat.tick() => {
                    if let Some(link) = &self.link {
                        link.heartbeat().await;
                    }
                },
            }

            self.flush().await;
        }

        self.shutdown().await;
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        let now = Instant::now();

        match event {
            TransportEvent::Message { sender, message } => {
                self.session.handle_message(&sender, message, now);
            }
            TransportEvent::Presence { action, member } => {
                debug!("Presence {:?} from {}", action, member.client_id);
                self.session.handle_presence(action, &member, now);
                // Follow every change with a full roster pass
                if let Some(link) = &self.link {
                    link.request_members().await;
                }
            }
            TransportEvent::Members(members) => {
                let removed = self.session.handle_members(&members, now);
                if !removed.is_empty() {
                    info!("Roster pass removed {:?}", removed);
                }
            }
            TransportEvent::Closed { reason } => self.link_lost(&reason),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Controls(controls) => self.session.set_controls(controls),
            Command::Fire => {
                if !self.suspended {
                    self.session.fire(timestamp_ms());
                }
            }
            Command::Dash => {
                if !self.suspended {
                    self.session.start_dash();
                }
            }
            Command::Suspend => {
                if self.suspended {
                    return;
                }
                info!("Suspending, leaving presence");
                self.suspended = true;
                if let Some(link) = &self.link {
                    link.presence_leave().await;
                }
            }
            Command::Resume => {
                if !self.suspended {
                    return;
                }
                info!("Resuming");
                self.suspended = false;
                self.last_tick = Instant::now();
                self.enter_presence().await;
            }
            Command::Shutdown => {}
        }
    }

    /// One simulation step. A panic inside the step is logged and surfaced
    /// as a notice; the loop keeps going.
    fn run_tick(&mut self) {
        let now = Instant::now();
        let frame = Frame {
            now,
            wall_ms: timestamp_ms() as f64,
            dt: now.duration_since(self.last_tick).as_secs_f32(),
        };
        self.last_tick = now;

        let session = &mut self.session;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| session.tick(frame))) {
            let reason = panic_message(panic.as_ref());
            error!("Simulation tick panicked: {}", reason);
            self.session
                .set_notice(format!("Recovered from a simulation error: {}", reason));
        }

        self.publish_snapshot();
    }

    async fn enter_presence(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        match self.session.presence_data().encode() {
            Ok(data) => link.presence_enter(data).await,
            Err(e) => error!("Failed to encode presence data: {}", e),
        }
        link.request_members().await;
    }

    async fn flush(&mut self) {
        let outbound = self.session.drain_outbox();
        let Some(link) = &self.link else {
            return;
        };

        for item in outbound {
            match item {
                Outbound::Publish(message) => match message.encode() {
                    Ok(data) => link.publish(message.topic(), data).await,
                    Err(e) => error!("Failed to encode {} message: {}", message.topic(), e),
                },
                Outbound::PresenceUpdate(presence) => {
                    if self.suspended {
                        continue;
                    }
                    match presence.encode() {
                        Ok(data) => link.presence_update(data).await,
                        Err(e) => error!("Failed to encode presence data: {}", e),
                    }
                }
            }
        }
    }

    /// The relay dropped us: play offline and keep trying to get back.
    fn link_lost(&mut self, reason: &str) {
        self.go_offline(reason);
        if self.options.offline || self.reconnect.is_some() {
            return;
        }
        info!("Reconnecting to {}", self.options.relay);
        let config = self.session.config();
        self.reconnect = Some(Reconnect::spawn(
            self.options.clone(),
            self.session.local_id().to_string(),
            config.reconnect_delay,
            config.reconnect_max_delay,
        ));
        self.session.set_notice(format!("Offline: {}, reconnecting", reason));
        self.publish_snapshot();
    }

    async fn relink(&mut self, connected: Option<Connected>) {
        self.reconnect = None;
        let Some((link, events)) = connected else {
            self.link_lost("Reconnect task stopped");
            return;
        };

        info!("Back on the relay as {}", link.client_id());
        self.link = Some(link);
        self.events = Some(events);
        self.session.set_online(true);
        self.session.set_notice("Reconnected");
        if self.suspended {
            if let Some(link) = &self.link {
                link.request_members().await;
            }
        } else {
            self.enter_presence().await;
        }
        self.publish_snapshot();
    }

    fn go_offline(&mut self, reason: &str) {
        if self.link.is_none() && self.events.is_none() {
            return;
        }
        warn!("Going offline: {}", reason);
        self.link = None;
        self.events = None;
        self.session.set_online(false);
        self.session.set_notice(format!("Offline: {}", reason));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }

    async fn shutdown(mut self) {
        info!("Shutting down session {}", self.session.local_id());
        self.reconnect = None;
        self.flush().await;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.session.set_online(false);
        self.publish_snapshot();
    }
}

/// Pending forever once the relay is gone, so `select!` simply stops polling it.
async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Pending forever while no reconnect is under way.
async fn next_reconnect(reconnect: &mut Option<Reconnect>) -> Option<Connected> {
    match reconnect {
        Some(task) => (&mut task.0).await.ok(),
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
