use analyst_chat::agent::Agent;
use analyst_chat::config::{self, Config};
use analyst_chat::dev::ReloadWatcher;
use analyst_chat::transport::{self, AppState};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "analyst-chat")]
#[command(author, version, about = "Chat with a data-analyst agent in your browser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory the agent's file tools and databases live in (default: current directory)
        #[arg(long)]
        cwd: Option<String>,

        /// Open the chat page in a browser once the server is up
        #[arg(long, overrides_with = "no_browser")]
        launch_browser: bool,

        /// Do not open a browser
        #[arg(long)]
        no_browser: bool,

        /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
        #[arg(long)]
        log_level: Option<String>,

        /// Serve static assets from disk and refresh the page when they change
        #[arg(long, overrides_with = "no_reload")]
        reload: bool,

        /// Serve the embedded assets only
        #[arg(long)]
        no_reload: bool,
    },
}

/// `--flag` / `--no-flag` pair over a configured default
fn flag(on: bool, off: bool, default: bool) -> bool {
    if off {
        false
    } else {
        on || default
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Per-run telemetry stays off for this process
    std::env::set_var(config::TELEMETRY_ENV, "false");

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });

    match cli.command {
        Commands::Serve {
            host,
            port,
            cwd,
            launch_browser,
            no_browser,
            log_level,
            reload,
            no_reload,
        } => {
            let log_level = log_level.unwrap_or_else(|| config.server.log_level.clone());
            let filter = format!("analyst_chat={},tower_http={},warn", log_level, log_level);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| filter.into()),
                )
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();

            let working_dir = cwd
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| ".".into()));
            let working_dir = working_dir.canonicalize().unwrap_or(working_dir);
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let launch_browser = flag(launch_browser, no_browser, config.server.launch_browser);
            let reload = flag(reload, no_reload, config.server.reload);

            tracing::info!(
                "Starting chat server on {}:{}, cwd: {:?}",
                host,
                port,
                working_dir
            );

            let agent = Agent::from_config(&config, &working_dir)
                .context("Failed to configure the agent")?;

            let static_dir = if reload {
                static_dir(&config.server.static_dir)
            } else {
                None
            };
            let state = Arc::new(AppState::new(Arc::new(agent), static_dir.clone()));
            state.spawn_session_sweeper(Duration::from_secs(
                config.server.session_idle_timeout_secs,
            ));

            // Held for the server's lifetime
            let _watcher = match &static_dir {
                Some(dir) => Some(ReloadWatcher::spawn(dir, state.reload_sender())?),
                None => None,
            };

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutting down");
            };

            transport::run_http_server(state, &host, port, launch_browser, shutdown).await?;
        }
    }

    Ok(())
}

/// Asset directory for live reload, if it exists
fn static_dir(configured: &str) -> Option<PathBuf> {
    let dir = PathBuf::from(configured);
    let dir = if dir.is_absolute() {
        dir
    } else {
        std::env::current_dir().ok()?.join(dir)
    };
    if dir.is_dir() {
        Some(dir)
    } else {
        tracing::warn!(
            "Static directory {} not found; live reload disabled",
            dir.display()
        );
        None
    }
}
