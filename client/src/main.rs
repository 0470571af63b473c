use clap::Parser;
use client::game::SessionConfig;
use client::identity::Identity;
use client::input::InputManager;
use client::network::{Command, DriverHandle, LinkOptions, SessionDriver};
use client::rendering::Renderer;
use log::{error, info};
use macroquad::prelude::*;
use shared::DEFAULT_CHANNEL;
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address to connect to
    #[arg(short = 'r', long, default_value = "127.0.0.1:8080")]
    relay: String,

    /// Room to join
    #[arg(short = 'c', long, default_value = DEFAULT_CHANNEL)]
    channel: String,

    /// Display name (defaults to "Bird" plus part of the session id)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Bird colour as #rrggbb
    #[arg(long)]
    color: Option<String>,

    /// Play without a relay
    #[arg(long)]
    offline: bool,

    /// How long each relay handshake step may take
    #[arg(long, default_value = "3000")]
    connect_timeout_ms: u64,

    /// Window width
    #[arg(short = 'w', long, default_value = "900")]
    width: usize,

    /// Window height (no short flag to avoid conflict with --help)
    #[arg(long, default_value = "900")]
    height: usize,
}

static ARGS: OnceLock<Args> = OnceLock::new();

/// Command line, parsed on first use; the window config needs it before `main` runs.
fn args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

fn window_conf() -> Conf {
    let args = args();
    Conf {
        window_title: "Bird Garden".to_string(),
        window_width: args.width as i32,
        window_height: args.height as i32,
        ..Default::default()
    }
}

/// Runs the session driver on its own tokio runtime and hands back its handle.
fn spawn_driver(
    identity: Identity,
    options: LinkOptions,
) -> Result<(DriverHandle, std::thread::JoinHandle<()>), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let (handle_tx, handle_rx) = std_mpsc::channel();

    let thread = std::thread::spawn(move || {
        runtime.block_on(async move {
            let (driver, handle) =
                SessionDriver::start(identity, options, SessionConfig::default()).await;
            if handle_tx.send(handle).is_err() {
                return;
            }
            driver.run().await;
        });
    });

    let handle = handle_rx.recv()?;
    Ok((handle, thread))
}

#[macroquad::main(window_conf)]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = args();

    let identity = Identity::generate(&mut ::rand::thread_rng(), args.name.clone(), args.color.clone());

    info!("Starting client as {} ({})", identity.name, identity.id);
    if args.offline {
        info!("Offline mode");
    } else {
        info!("Relay: {}, room: {}", args.relay, args.channel);
    }
    info!("Controls: W/S forward, A/D turn, Space/Shift climb, X fire, Z dash, P away");

    let options = LinkOptions {
        relay: args.relay.clone(),
        channel: args.channel.clone(),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        offline: args.offline,
    };

    let (handle, thread) = match spawn_driver(identity, options) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to start session: {}", e);
            return;
        }
    };

    let mut input = InputManager::new();
    let mut renderer = Renderer::new(args.width, args.height);
    let mut away = false;

    prevent_quit();

    loop {
        if is_quit_requested() {
            break;
        }

        let frame = input.update();
        if frame.controls_changed {
            handle.send(Command::Controls(frame.controls));
        }
        if frame.fire {
            handle.send(Command::Fire);
        }
        if frame.dash {
            handle.send(Command::Dash);
        }
        if frame.toggle_away {
            away = !away;
            handle.send(if away { Command::Suspend } else { Command::Resume });
        }

        renderer.resize(screen_width(), screen_height());
        renderer.render(&handle.snapshot());

        next_frame().await;
    }

    info!("Window closed, leaving the room");
    handle.send(Command::Shutdown);
    if thread.join().is_err() {
        error!("Session thread panicked");
    }
}
