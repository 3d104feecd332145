//! halfway: meet your friends halfway.
//!
//! `halfway signal` runs the relay that peers claim addresses on.
//! `halfway join [ROOM]` joins a room over that relay and reads
//! commands from stdin.

mod config;
mod console;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use halfway_mesh::{
    generate_pseudonym, generate_room_id, MeshEvent, MeshHandle, MeshNode, Member, RoomId,
    RoomView, SignalServer, WsSubstrate,
};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use config::NodeConfig;
use console::ConsoleCommand;

#[derive(Parser)]
#[command(name = "halfway")]
#[command(version, about = "Peer-to-peer room coordination")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "HALFWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Signal {
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
    },

    /// Join a room, creating a fresh id when none is given
    Join {
        /// Room identifier
        room: Option<String>,

        /// Display name (default: a generated pseudonym)
        #[arg(long)]
        name: Option<String>,

        /// Relay server URL
        #[arg(long, env = "HALFWAY_RELAY_URL")]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Signal { bind } => run_signal(config, bind).await,
        Commands::Join { room, name, relay } => run_join(config, room, name, relay).await,
    }
}

async fn run_signal(mut config: NodeConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.signal.bind_addr = bind;
    }
    let server = SignalServer::new(config.signal);
    info!("Starting relay on {}", server.bind_addr());
    server
        .run()
        .await
        .with_context(|| format!("relay on {}", server.bind_addr()))
}

async fn run_join(
    config: NodeConfig,
    room: Option<String>,
    name: Option<String>,
    relay: Option<String>,
) -> Result<()> {
    let room = match room {
        Some(raw) => RoomId::parse(&raw)?,
        None => generate_room_id(),
    };
    let name = name.unwrap_or_else(generate_pseudonym);
    let relay = relay.unwrap_or(config.relay_url);

    let substrate = WsSubstrate::with_capacity(&relay, config.mesh.channel_capacity);
    let (handle, events) = MeshNode::start(substrate, config.mesh, room.clone(), Member::new(name))
        .await
        .with_context(|| format!("joining {room} via {relay}"))?;

    println!("Joined room {room}. Type `help` for commands.");
    let printer = tokio::spawn(print_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match console::parse(&line) {
                    Ok(ConsoleCommand::Leave) => break,
                    Ok(cmd) => {
                        if let Err(e) = execute(&handle, cmd).await {
                            warn!("Command failed: {e}");
                        }
                    }
                    Err(msg) => println!("{msg}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = handle.notify_leaving().await {
        warn!("Could not announce leaving: {e}");
    }
    handle.cleanup().await?;
    printer.abort();
    Ok(())
}

async fn execute(handle: &MeshHandle, cmd: ConsoleCommand) -> Result<()> {
    match cmd {
        ConsoleCommand::AddLocation(location) => handle.add_location(location).await?,
        ConsoleCommand::RemoveLocation(index) => {
            if handle.remove_location(index).await?.is_none() {
                println!("No location #{index}");
            }
        }
        ConsoleCommand::Rename(name) => {
            if !handle.rename(name).await? {
                println!("Name unchanged");
            }
        }
        ConsoleCommand::Title(title) => {
            handle.set_title(title).await?;
        }
        ConsoleCommand::Who => print_room(&handle.roster().await?),
        ConsoleCommand::Status => {
            let status = handle.status().await?;
            let address = status
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            let role = status.role.map(|r| r.label()).unwrap_or("-");
            println!(
                "{:?} (generation {}) at {address} as {role}, {} open channel(s){}",
                status.link,
                status.generation,
                status.open_channels,
                if status.degraded { ", fallback slot" } else { "" }
            );
        }
        ConsoleCommand::Resume => handle.resume().await?,
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Leave => {}
    }
    Ok(())
}

fn print_room(view: &RoomView) {
    println!("{} [{}]", view.title, view.room);
    for entry in &view.entries {
        let tag = if entry.local { " (you)" } else { "" };
        println!("  {}{tag} {:?}", entry.member.name, entry.status);
        for (i, loc) in entry.member.locations.iter().enumerate() {
            println!("    #{i} {} ({:.5}, {:.5})", loc.address, loc.lat, loc.lng);
        }
    }
    match view.midpoint {
        Some((lat, lng)) => println!("  midpoint: {lat:.5}, {lng:.5}"),
        None => println!("  midpoint: no locations yet"),
    }
}

async fn print_events(mut events: mpsc::Receiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::IdentityAssigned { address, host, degraded } => {
                let role = if host { "host" } else { "guest" };
                let note = if degraded { " (fallback slot)" } else { "" };
                println!("* you are {address}, {role}{note}");
            }
            MeshEvent::MemberJoined(m) => println!("* {} joined", m.name),
            MeshEvent::MemberUpdated(m) => {
                println!("* {} has {} location(s)", m.name, m.locations.len())
            }
            MeshEvent::MemberLeft(m) => println!("* {} left", m.name),
            MeshEvent::ConnectionStatusChanged { user_id, status } => {
                log::debug!("{user_id} is now {status:?}")
            }
            MeshEvent::LinkStateChanged(state) => println!("* link {state:?}"),
            MeshEvent::TitleChanged(title) => println!("* room title: {title}"),
            MeshEvent::RosterReplaced(members) => {
                println!("* roster synced, {} member(s)", members.len())
            }
        }
    }
}
