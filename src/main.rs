use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use agenthq::api::{AppState, create_router};
use agenthq::auth::AuthStore;
use agenthq::config::{ConfigStore, META_DIR};
use agenthq::core::Broker;

#[derive(Parser)]
#[command(name = "agenthq")]
#[command(version)]
#[command(about = "Control plane for agent PTY sessions")]
#[command(long_about = "\
agenthq brokers interactive terminal sessions between daemons running on
developer VMs (which fork the agent processes) and browser clients (which
attach to view output and send keystrokes).

The server never launches a PTY itself. Daemons dial in over /ws/daemon
with the configured auth token; browsers attach over /ws/browser with a
session cookie. Every byte of terminal traffic is routed through the
in-memory broker, with the most recent 1 MiB of output per process kept
for late joiners.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG                Log level filter (default: agenthq=info)
    AGENTHQ_LOG_FORMAT      Set to 'json' for JSON file logs
    AGENTHQ_WORKSPACE       Default workspace directory
    AGENTHQ_SERVER_URL      Public server URL fallback (when unset on disk)
    AGENTHQ_DAEMON_TOKEN    Daemon auth token fallback (when unset on disk)
    AGENTHQ_USER            Username to seed at startup
    AGENTHQ_PASSWORD        Password for the seeded user

FILE LOCATIONS (under <workspace>/.agenthq-meta/):
    config.json             Environments, server URL, daemon token
    auth.sqlite             Users, sessions, device PINs
    logs/                   Per-start log files with latest.log symlinks

OPERATIONAL NOTES:
    Daemon registration falls back to the first local environment when
    nothing matches; two unrelated daemons can claim it in sequence and
    the last registration wins.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control-plane server
    Serve {
        /// Workspace directory containing repos and server metadata
        #[arg(long, env = "AGENTHQ_WORKSPACE")]
        workspace: PathBuf,

        /// HTTP bind port
        #[arg(long, default_value_t = 3030)]
        port: u16,

        /// HTTP bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind_addr: String,

        /// Auth database path (default: <workspace>/.agenthq-meta/auth.sqlite)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            workspace,
            port,
            bind_addr,
            db_path,
        } => run_server(&workspace, port, &bind_addr, db_path).await,
    }
}

async fn run_server(
    workspace: &Path,
    port: u16,
    bind_addr: &str,
    db_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    // Workspace validation is the only fatal startup check.
    if !workspace.is_dir() {
        anyhow::bail!(
            "workspace directory does not exist: {}",
            workspace.display()
        );
    }
    let workspace = workspace.canonicalize()?;

    initialize_logging(&workspace)?;
    tracing::info!("agenthq v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("PID: {}", std::process::id());
    tracing::info!(workspace = %workspace.display(), "Workspace");

    let config = Arc::new(ConfigStore::load(&workspace)?);
    if config.daemon_auth_token().is_none() {
        tracing::warn!(
            "No daemon auth token configured; daemon connections will be rejected with 4003"
        );
    }

    let db_path =
        db_path.unwrap_or_else(|| workspace.join(META_DIR).join("auth.sqlite"));
    let auth = AuthStore::new(&db_path).await?;

    if let (Ok(username), Ok(password)) = (
        std::env::var("AGENTHQ_USER"),
        std::env::var("AGENTHQ_PASSWORD"),
    ) {
        auth.seed_user(&username, &password).await?;
    }

    let broker = Arc::new(Broker::new(Arc::clone(&config)));
    let found = broker.repos.scan_local(&workspace);
    tracing::info!(repos = found, "Scanned workspace for local repos");

    let state = AppState {
        broker,
        auth,
        workspace,
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{bind_addr}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize console + file logging.
///
/// Each server start gets its own timestamped log file, with a
/// `latest.log` symlink for convenience. `AGENTHQ_LOG_FORMAT=json`
/// switches the file layer to JSON.
fn initialize_logging(workspace: &Path) -> anyhow::Result<()> {
    let logs_dir = workspace.join(META_DIR).join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("agenthq.{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let _ = std::fs::remove_file(logs_dir.join("latest.log"));
        let _ = symlink(&log_filename, logs_dir.join("latest.log"));
    }

    let json_format = std::env::var("AGENTHQ_LOG_FORMAT")
        .map(|value| value.to_lowercase() == "json")
        .unwrap_or(false);

    let rust_log_value = std::env::var("RUST_LOG").unwrap_or_else(|_| "agenthq=info".into());
    let console_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);
    let file_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(cfg!(debug_assertions));

    if json_format {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_filter(file_filter),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
            .init();
    }

    Ok(())
}
