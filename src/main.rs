use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use codemate_sync::error::RetryPolicy;
use codemate_sync::terminal::{self, LineKind};
use codemate_sync::{clock, server, RemoteTransport, RoomId, Session, SessionEvent, SyncConfig};

const DEFAULT_FILTER: &str = "codemate_sync=info";

#[derive(Parser)]
#[command(name = "codemate")]
#[command(about = "Real-time collaboration core: relay server and room terminal", version)]
#[command(after_help = "Rooms:
- A room id such as 'k3j9x2' joins as a collaborator
- 'view-k3j9x2' joins the same room read-only
- Omit --room to create a new room

Inside a room, type 'help' or 'db help' for commands and 'exit' to leave.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(short, long, default_value = "8765")]
        port: u16,
    },

    /// Join a room and open an interactive terminal
    Join {
        /// Relay WebSocket URL, e.g. ws://localhost:8765/ws
        #[arg(long, value_name = "URL")]
        relay: Option<String>,

        /// Room id or link fragment
        #[arg(long)]
        room: Option<String>,

        /// Display name (defaults to the OS user name)
        #[arg(short, long)]
        name: Option<String>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Also write daily rotated log files here
        #[arg(long, value_name = "DIR")]
        log_dir: Option<PathBuf>,
    },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn terminal_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().with_writer(std::io::stderr).with_filter(env_filter())
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(terminal_layer()).try_init()?;
        return Ok(None);
    };

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "codemate.log"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_line_number(true)
        .with_writer(file_writer)
        .with_filter(env_filter());
    tracing_subscriber::registry()
        .with(file_layer)
        .with(terminal_layer())
        .try_init()?;
    Ok(Some(guard))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            init_logging(None)?;
            println!(
                "{}",
                format!("🌐 Starting relay on port {}...", port).cyan().bold()
            );
            server::start(port).await?;
        }

        Commands::Join {
            relay,
            room,
            name,
            config,
            log_dir,
        } => {
            let _guard = init_logging(log_dir.as_deref())?;
            let config = SyncConfig::load(config.as_deref())?;
            let relay = relay
                .or_else(|| config.relay_url.clone())
                .ok_or_else(|| anyhow!("no relay given; pass --relay or set CODEMATE_RELAY_URL"))?;
            let name = name.unwrap_or_else(whoami::username);
            join(&relay, room.as_deref().unwrap_or(""), &name, config).await?;
        }
    }

    Ok(())
}

async fn join(relay: &str, room: &str, name: &str, config: SyncConfig) -> Result<()> {
    let room = RoomId::parse(room);
    println!("{}", format!("🔗 Connecting to {}...", relay).cyan().bold());
    let transport = RemoteTransport::connect_with_retry(
        relay,
        room.root(&config.namespace),
        config.ack_timeout(),
        &RetryPolicy::default(),
    )
    .await?;

    let session = Session::start(Arc::new(transport), room.clone(), config, clock::system()).await;
    if room.is_read_only() {
        println!("{} Joined room {} (view only)", "✓".green(), room.id().bright_yellow());
    } else {
        let me = session.join(name).await?;
        println!(
            "{} Joined room {} as {}",
            "✓".green(),
            room.id().bright_yellow(),
            me.name.bright_white()
        );
        println!("  Share:     {}", format!("#{}", room.share_fragment()).bright_blue());
    }
    println!("  View only: {}", format!("#{}", room.view_fragment()).bright_blue());

    let mut events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if matches!(line, "exit" | "quit") {
                    break;
                }
                for out in terminal::run(&session, line).await {
                    print_line(out.kind, &out.text);
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::PeerListChanged) => {
                        let names: Vec<String> = session.presence().peers().into_iter().map(|p| p.name).collect();
                        println!("{} {}", "users:".bright_black(), names.join(", "));
                    }
                    Ok(SessionEvent::DocumentChanged(doc)) => {
                        println!("{} {}", "changed:".bright_black(), doc);
                    }
                    Ok(SessionEvent::DatabaseStateChanged) => {
                        println!("{}", "database reloaded from a peer".bright_black());
                    }
                    Err(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    println!("{}", "👋 Left room".cyan());
    Ok(())
}

fn print_line(kind: LineKind, text: &str) {
    match kind {
        LineKind::Info => println!("{}", text.green()),
        LineKind::Log => println!("{}", text),
        LineKind::Warn => println!("{}", text.yellow()),
        LineKind::Error => eprintln!("{}", text.red()),
    }
}
