mod core;
mod http;
mod mpv;
mod sink;
mod socket;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use songfall_engine::plugin::js::JsScriptHost;
use songfall_engine::{FallbackController, SourceRegistry, SourceResolver};
use songfall_proto::config::Config;
use songfall_proto::protocol::{Command, SourceInfo};
use songfall_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "songfall-daemon")]
#[command(about = "Resolves songs across fallback sources and plays them through mpv", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use mpv from PATH instead of a bundled copy
    #[arg(long)]
    system_deps: bool,

    /// Song to play once the daemon is up
    #[arg(long, value_name = "SONG_ID")]
    play: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
    Error(String),
    Exhausted { song_id: String, attempts: usize },
}

/// Forwards WARN and ERROR events to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn init_logging(broadcast_tx: broadcast::Sender<BroadcastMessage>) -> anyhow::Result<PathBuf> {
    let data_dir = songfall_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer {
            sender: broadcast_tx,
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,songfall_daemon=debug,songfall_engine=debug",
                )
            }),
        )
        .init();
    Ok(log_path)
}

async fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, std::process::id().to_string()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    songfall_proto::platform::set_use_system_deps(cli.system_deps);

    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);
    let log_path = init_logging(broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Config loaded, {} sources", config.sources.len());
    write_pid_file(&config.daemon.pid_file).await?;

    let first_run = !config.daemon.state_file.exists();
    let state_manager = Arc::new(StateManager::new(
        config.daemon.state_file.clone(),
        config.sources.iter().map(SourceInfo::from).collect(),
    ));
    if first_run {
        state_manager.set_volume(config.mpv.default_volume).await?;
    }
    let default_source = state_manager.get_state().await.default_source;

    let (event_tx, event_rx) = mpsc::channel::<core::DaemonEvent>(256);

    let registry = SourceRegistry::new(config.sources.clone())?;
    let host = Arc::new(JsScriptHost::spawn()?);
    let resolver = SourceResolver::new(&config.resolver, host)?;
    let controller = Arc::new(
        FallbackController::new(
            registry,
            Arc::new(resolver),
            Arc::new(sink::CoreSink::new(event_tx.clone())),
        )
        .with_default_source(default_source),
    );

    let daemon_core = core::DaemonCore::new(
        config.clone(),
        state_manager.clone(),
        controller,
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .await;

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        songfall_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    if let Some(song_id) = cli.play {
        event_tx
            .send(core::DaemonEvent::ClientCommand(Command::Play { song_id }))
            .await?;
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    let result = daemon_core.run(event_rx).await;
    let _ = tokio::fs::remove_file(&config.daemon.pid_file).await;
    result
}
