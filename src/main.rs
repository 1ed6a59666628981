//! porterm - terminal client for a porterminal-style server.
//!
//! `porterm list` prints the server's tabs, `porterm new` creates one and
//! attaches to it, `porterm attach <tab>` attaches to an existing tab.
//! While attached, press Ctrl+] to detach.

use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand};
use futures::StreamExt;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use porterm::{
    app::{Workspace, WorkspaceError},
    config::{ClientConfig, ConfigError},
    control::{ControlChannel, ControlError, Roster},
    registry::ConnectionRegistry,
    session::{LocalId, SessionEvent},
    sink::{RenderSink, StdoutSink},
    terminal,
};

/// porterm - attach to remote terminal tabs over WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "porterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server address (host:port, http(s)://, or ws(s)://)
    #[arg(long, env = "PORTERM_SERVER", global = true)]
    server: Option<String>,

    /// Password for servers that require authentication
    #[arg(long, env = "PORTERM_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tabs on the server
    List {
        /// Keep printing the roster as it changes
        #[arg(long)]
        watch: bool,
    },

    /// Create a tab and attach to it
    New {
        /// Shell id to start (server default if omitted)
        #[arg(long)]
        shell: Option<String>,
    },

    /// Attach to an existing tab, by id or name
    Attach {
        tab: String,

        /// Do not replay the server's buffered output
        #[arg(long)]
        skip_buffer: bool,
    },

    /// Close a tab, by id or name
    Close { tab: String },

    /// Rename a tab
    Rename { tab: String, name: String },
}

#[derive(Error, Debug)]
pub enum PortermError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("session {0} could not be reconnected after {1} attempts")]
    ConnectionLost(LocalId, u32),

    #[error("session {0} no longer exists on the server (close code {1})")]
    SessionGone(LocalId, u16),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(cli).await {
        eprintln!("porterm: {}", e);
        std::process::exit(1);
    }
}

/// Tracing goes to stderr; stdout carries terminal output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "porterm=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), PortermError> {
    let path = cli.config.clone().or_else(ClientConfig::default_path);
    let config = match path {
        Some(path) => ClientConfig::load(&path)?.unwrap_or_default(),
        None => ClientConfig::default(),
    };

    let base_url = config.base_url(cli.server.as_deref());
    let password = cli.password.clone().or_else(|| config.password.clone());
    tracing::debug!(%base_url, "using server");

    let control =
        ControlChannel::connect(config.control_config(&base_url, password.as_deref())).await?;
    let registry = ConnectionRegistry::new(config.session_config(&base_url, password.as_deref()));
    let mut workspace = Workspace::new(control, registry, |_tab| {
        Box::new(StdoutSink) as Box<dyn RenderSink>
    });

    let result = match cli.command {
        Commands::List { watch } => run_list(&workspace, watch).await,
        Commands::New { shell } => {
            let shell = shell.or_else(|| config.shell.clone());
            match workspace.create_tab(shell).await {
                Ok((tab, _)) => run_attach(&mut workspace, &tab.id, false).await,
                Err(e) => Err(e.into()),
            }
        }
        Commands::Attach { tab, skip_buffer } => run_attach(&mut workspace, &tab, skip_buffer).await,
        Commands::Close { tab } => workspace.close_tab(&tab).await.map_err(Into::into),
        Commands::Rename { tab, name } => match workspace.rename_tab(&tab, &name).await {
            Ok(tab) => {
                println!("{}\t{}", tab.id, tab.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    workspace.shutdown().await;
    result
}

async fn run_list(workspace: &Workspace, watch: bool) -> Result<(), PortermError> {
    if !watch {
        print_roster(&workspace.roster());
        return Ok(());
    }

    let mut updates = workspace.roster_updates();
    loop {
        tokio::select! {
            roster = updates.next() => match roster {
                Some(roster) => print_roster(&roster),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if workspace.control().is_closed() {
            return Err(ControlError::ChannelClosed.into());
        }
    }
    Ok(())
}

fn print_roster(roster: &Roster) {
    if roster.is_empty() {
        println!("No open tabs.");
        return;
    }
    println!("{:<38} {:<20} {:<10} {}", "ID", "NAME", "SHELL", "SESSION");
    for tab in roster.tabs() {
        println!("{:<38} {:<20} {:<10} {}", tab.id, tab.name, tab.shell_id, tab.session_id);
    }
}

async fn run_attach(workspace: &mut Workspace, key: &str, skip_buffer: bool) -> Result<(), PortermError> {
    let (cols, rows) = terminal::terminal_size().unwrap_or((120, 30));

    // Register first so the geometry is known before the socket settles.
    let id = workspace.attach(key, skip_buffer)?;
    workspace.send_resize(id, cols, rows)?;

    let raw_guard = terminal::RawModeGuard::new()?;
    let mut stdin = terminal::spawn_stdin_reader();
    let mut resizes = terminal::spawn_resize_watcher();

    let result = loop {
        tokio::select! {
            data = stdin.recv() => {
                let Some(data) = data else { break Ok(()) };
                let (forward, detach) = terminal::split_detach(&data);
                if !forward.is_empty() {
                    workspace.send_input(id, forward)?;
                }
                if detach {
                    break Ok(());
                }
            }
            (cols, rows) = resizes.changed() => {
                workspace.send_resize(id, cols, rows)?;
            }
            event = workspace.next_event() => {
                let Some(event) = event else { break Ok(()) };
                if event.local_id() != id {
                    continue;
                }
                match event {
                    SessionEvent::Stale { code, .. } => break Err(PortermError::SessionGone(id, code)),
                    SessionEvent::PermanentFailure { attempts, .. } => {
                        break Err(PortermError::ConnectionLost(id, attempts))
                    }
                    SessionEvent::Reconnecting { attempt, delay, .. } => {
                        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "connection lost, retrying");
                    }
                    SessionEvent::ServerError { message, .. } => {
                        tracing::warn!(%message, "server error");
                    }
                    _ => {}
                }
            }
        }
    };

    drop(raw_guard);
    result
}
