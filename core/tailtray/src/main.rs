//! tailtray: command-line front end for the tray reconciliation core.
//!
//! Runs the same engine a tray UI would, against the local daemon, and prints
//! what the UI would show.
//!
//! ## Subcommands
//!
//! - `status` / `peers`: one polling cycle, then print the snapshot or peer list
//! - `monitor`: listen until Ctrl-C, printing every field change
//! - `up`, `down`, `login`, `logout`, `exit-node`, `set`: mutate the daemon,
//!   then re-poll and print the resulting state

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tailtray_core::{
    gateway, LoginFlags, PeerRecord, PollOutcome, Preference, ReconciliationEngine, Snapshot,
    StateChange, TransportKind, TrayConfig, TrayError, UpFlags,
};

#[derive(Parser)]
#[command(name = "tailtray")]
#[command(about = "Mesh VPN tray state from the command line")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/tailtray/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Transport used to reach the daemon
    #[arg(long, global = true, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// LocalAPI socket path (socket transport only)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll once and print the connection snapshot
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Poll once with a full peer sync and print the peer list
    Peers {
        #[arg(long)]
        json: bool,
    },

    /// Listen for changes until interrupted
    Monitor,

    /// Bring the connection up
    Up,

    /// Bring the connection down
    Down,

    /// Start an interactive login and print the URL to visit
    Login,

    /// Log out of the network
    Logout,

    /// Select an exit node by name, IP or id; omit to clear
    ExitNode {
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },

    /// Toggle a preference
    Set {
        #[arg(value_parser = parse_preference)]
        preference: Preference,

        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Tray(#[from] TrayError),

    #[error("Polling the daemon failed; see the log for details")]
    PollFailed,

    #[error("No peer matches exit node {0:?}")]
    UnknownExitNode(String),

    #[error("Could not encode output: {0}")]
    Output(#[from] serde_json::Error),
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    value.parse()
}

fn parse_preference(value: &str) -> Result<Preference, String> {
    Preference::from_name(value).ok_or_else(|| {
        let known: Vec<&str> = Preference::ALL.iter().map(|pref| pref.name()).collect();
        format!("expected one of: {}", known.join(", "))
    })
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tailtray: {}", e);
            std::process::exit(1);
        }
    };

    let _logging_guard = logging::init(&config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            eprintln!("tailtray: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli.command, config)) {
        tracing::error!(error = %e, "tailtray failed");
        eprintln!("tailtray: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> tailtray_core::Result<TrayConfig> {
    let mut config = match &cli.config {
        Some(path) => TrayConfig::load_from(path)?.with_env_overrides(),
        None => TrayConfig::load()?,
    };
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(socket) = &cli.socket {
        config.socket_path = socket.clone();
    }
    Ok(config)
}

async fn run(command: Commands, config: TrayConfig) -> Result<(), CliError> {
    let gateway = gateway::from_config(&config);
    let engine = ReconciliationEngine::new(Arc::clone(&gateway), config.engine_config())?;

    match command {
        Commands::Status { json } => {
            poll(&engine, false).await?;
            print_snapshot(&engine, json)
        }
        Commands::Peers { json } => {
            poll(&engine, true).await?;
            print_peers(&engine, json)
        }
        Commands::Monitor => monitor(&engine).await,
        Commands::Up => {
            gateway.up(&UpFlags::from_config(&config)).await?;
            after_mutation(&engine).await
        }
        Commands::Down => {
            gateway.down().await?;
            after_mutation(&engine).await
        }
        Commands::Login => {
            let url = gateway.login(&LoginFlags::from_config(&config)).await?;
            println!("{}", url);
            Ok(())
        }
        Commands::Logout => {
            gateway.logout().await?;
            after_mutation(&engine).await
        }
        Commands::ExitNode { name } => {
            let target = match name {
                Some(name) => {
                    poll(&engine, true).await?;
                    Some(resolve_exit_node(&engine, config.transport, &name)?)
                }
                None => None,
            };
            gateway.set_exit_node(target.as_deref()).await?;
            after_mutation(&engine).await
        }
        Commands::Set {
            preference,
            enabled,
        } => {
            gateway.set_preference(preference, enabled).await?;
            after_mutation(&engine).await
        }
    }
}

async fn poll(engine: &ReconciliationEngine, full_peer_sync: bool) -> Result<(), CliError> {
    match engine.poll_once(full_peer_sync).await {
        PollOutcome::Applied { changes } => {
            tracing::debug!(changes, "Poll applied");
            Ok(())
        }
        PollOutcome::Skipped | PollOutcome::Discarded => Ok(()),
        PollOutcome::Failed => Err(CliError::PollFailed),
    }
}

async fn after_mutation(engine: &ReconciliationEngine) -> Result<(), CliError> {
    poll(engine, true).await?;
    print_snapshot(engine, false)
}

async fn monitor(engine: &ReconciliationEngine) -> Result<(), CliError> {
    poll(engine, true).await?;
    print_snapshot(engine, false)?;

    let subscription = engine.subscribe_all(|change: &StateChange| {
        tracing::info!(field = change.field().name(), "State changed");
        println!("{:<15} {}", change.field().name(), describe_change(change));
    });
    engine.listen();
    tracing::info!("Monitoring; press Ctrl-C to stop");

    let interrupted = tokio::signal::ctrl_c().await;
    engine.interrupt();
    engine.unsubscribe(subscription);
    interrupted.map_err(|e| TrayError::transport("waiting for Ctrl-C", e))?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Exit Node Resolution
// ═══════════════════════════════════════════════════════════════════════════════

fn peer_matches(peer: &PeerRecord, query: &str) -> bool {
    peer.id == query
        || peer.name.eq_ignore_ascii_case(query)
        || peer.domain.eq_ignore_ascii_case(query.trim_end_matches('.'))
        || (!peer.ip_v4.is_empty() && peer.ip_v4 == query)
        || (!peer.ip_v6.is_empty() && peer.ip_v6 == query)
}

/// Maps a user-supplied exit node to what the transport accepts.
///
/// The prefs API only takes node ids. The CLI takes an IP or name, so an
/// unknown query is passed through and left for the daemon to reject.
fn resolve_exit_node(
    engine: &ReconciliationEngine,
    transport: TransportKind,
    query: &str,
) -> Result<String, CliError> {
    let peer = engine.with_peers(|peers| {
        peers
            .iter()
            .find(|peer| peer_matches(peer, query))
            .map(Arc::clone)
    });
    exit_node_argument(peer.as_deref(), transport, query)
}

fn exit_node_argument(
    peer: Option<&PeerRecord>,
    transport: TransportKind,
    query: &str,
) -> Result<String, CliError> {
    match (transport, peer) {
        (TransportKind::Socket, Some(peer)) => Ok(peer.id.clone()),
        (TransportKind::Socket, None) => Err(CliError::UnknownExitNode(query.to_string())),
        (TransportKind::Cli, Some(peer)) if !peer.ip_v4.is_empty() => Ok(peer.ip_v4.clone()),
        (TransportKind::Cli, _) => Ok(query.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════════════════

fn print_snapshot(engine: &ReconciliationEngine, json: bool) -> Result<(), CliError> {
    let snapshot = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let exit_node = exit_node_label(engine, &snapshot);
    println!("{:<15} {}", "state", snapshot.state.label());
    println!("{:<15} {}", "network", snapshot.identity.network_name);
    println!("{:<15} {}", "domain", snapshot.identity.domain_suffix);
    println!("{:<15} {}", "self", snapshot.identity.self_node_id);
    println!("{:<15} {}", "exit node", exit_node);
    for preference in Preference::ALL {
        println!(
            "{:<15} {}",
            preference.name(),
            preference.read(&snapshot.prefs)
        );
    }
    if !snapshot.prefs.login_page_url.is_empty() {
        println!("{:<15} {}", "login page", snapshot.prefs.login_page_url);
    }
    if snapshot.health.is_healthy() {
        println!("{:<15} ok", "health");
    } else {
        for message in snapshot.health.messages() {
            println!("{:<15} {}", "health", message);
        }
    }
    if let Some(last_poll) = snapshot.last_poll {
        println!("{:<15} {}", "last poll", last_poll.to_rfc3339());
    }
    Ok(())
}

fn exit_node_label(engine: &ReconciliationEngine, snapshot: &Snapshot) -> String {
    let id = &snapshot.prefs.exit_node_id;
    if id.is_empty() {
        return "none".to_string();
    }
    match engine.find_peer(id) {
        Some(peer) => format!("{} ({})", peer.name, id),
        None => id.clone(),
    }
}

fn print_peers(engine: &ReconciliationEngine, json: bool) -> Result<(), CliError> {
    let peers = engine.peers();
    if json {
        let records: Vec<&PeerRecord> = peers.iter().map(|peer| peer.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for peer in &peers {
        println!("{}", peer_line(peer));
    }
    Ok(())
}

fn peer_line(peer: &PeerRecord) -> String {
    let marker = if peer.exit_active {
        '>'
    } else if peer.exit_support {
        '+'
    } else {
        ' '
    };
    let status = if peer.online { "online" } else { "offline" };
    format!(
        "{} {:<24} {:<16} {:<10} {:<8} {}",
        marker,
        peer.name,
        peer.ip_v4,
        peer.os,
        status,
        peer.tags_label()
    )
}

fn describe_change(change: &StateChange) -> String {
    match change {
        StateChange::State(state) => state.label().to_string(),
        StateChange::NetworkName(value)
        | StateChange::Domain(value)
        | StateChange::SelfNodeId(value)
        | StateChange::LoginPageUrl(value)
        | StateChange::ExitNode(value) => value.clone(),
        StateChange::Health(report) if report.is_healthy() => "ok".to_string(),
        StateChange::Health(report) => report.messages().join("; "),
        StateChange::AcceptRoutes(value)
        | StateChange::ShieldsUp(value)
        | StateChange::AllowLanAccess(value)
        | StateChange::WebClient(value) => value.to_string(),
        StateChange::Peers(list) => format!(
            "at {} removed {} added {}",
            list.position, list.removed, list.added
        ),
    }
}
