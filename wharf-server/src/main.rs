use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wharf_core::installer::{DependencyInstaller, InstallerConfig};
use wharf_core::orchestrator::{Orchestrator, OrchestratorHandle};
use wharf_core::scheduler::CronScheduler;
use wharf_core::watch::{FunctionWatcher, WatchConfig};
use wharf_core::{Logger, LoggerConfig, Registry, RouteTableHandle, ShutdownError};

use wharf_server::config::Config;
use wharf_server::{AppState, create_app};

/// Grace period for in-flight requests after a termination signal.
const REQUEST_DRAIN: Duration = Duration::from_secs(30);

/// Command line arguments for the Wharf function host
#[derive(Parser, Debug)]
#[command(name = "wharf-server")]
#[command(about = "Function host serving hot-reloaded user functions from a shared port")]
struct Args {
    /// Directory holding the user functions
    #[arg(long, default_value = "./functions")]
    functions_dir: PathBuf,

    /// Directory for main and per-function log files
    #[arg(long, default_value = "./logs")]
    logs_dir: PathBuf,

    /// Server port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    config.functions_dir = args.functions_dir;
    config.logs_dir = args.logs_dir;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wharf_server=info,wharf_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&config.functions_dir).with_context(|| {
        format!(
            "cannot create functions directory {}",
            config.functions_dir.display()
        )
    })?;

    let mut logger_config = LoggerConfig::new(&config.logs_dir);
    logger_config.min_level = config.log_level;
    let logger = Logger::new(logger_config).context("cannot initialize log sinks")?;

    let registry = Arc::new(Registry::new());
    let routes = Arc::new(RouteTableHandle::default());
    let scheduler = Arc::new(CronScheduler::new(logger.clone()));
    let installer = Arc::new(DependencyInstaller::new(InstallerConfig::default()));
    let orchestrator = Orchestrator::new(
        config.functions_dir.clone(),
        Arc::clone(&registry),
        Arc::clone(&routes),
        Arc::clone(&scheduler),
        installer,
        logger.clone(),
    );

    info!(
        functions_dir = %config.functions_dir.display(),
        logs_dir = %config.logs_dir.display(),
        "starting wharf"
    );
    orchestrator.sweep().await;

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(16);
    let watcher = FunctionWatcher::spawn(
        &config.functions_dir,
        Arc::clone(&registry),
        event_tx,
        WatchConfig::default(),
    )
    .context("cannot watch functions directory")?;

    // Management surface entry point; the dashboard is wired up here
    // when present.
    let _reload_handle = OrchestratorHandle::new(cmd_tx);

    let orchestrator_token = CancellationToken::new();
    let orchestrator_task = tokio::spawn(Arc::clone(&orchestrator).run(
        event_rx,
        cmd_rx,
        orchestrator_token.clone(),
    ));

    let state = AppState {
        registry: Arc::clone(&registry),
        routes: Arc::clone(&routes),
        logger: logger.clone(),
    };
    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    info!("wharf listening on {addr}");
    logger.info(
        "host started",
        json!({"addr": addr.to_string(), "functions": registry.running_count()}),
    );

    let drain_token = CancellationToken::new();
    let server_token = drain_token.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(server_token.cancelled_owned())
        .await
    });

    shutdown_signal().await;
    info!("termination signal received, draining");

    // Stop accepting, drain in-flight requests, then tear down the
    // reload pipeline and the scheduler, and flush the logs.
    drain_token.cancel();
    match timeout(REQUEST_DRAIN, &mut server_task).await {
        Ok(joined) => joined.context("server task panicked")??,
        Err(_) => {
            let err = ShutdownError {
                what: "in-flight requests".to_string(),
                seconds: REQUEST_DRAIN.as_secs(),
            };
            warn!("{err}");
            logger.warn(err.to_string(), json!({}));
            server_task.abort();
        }
    }

    watcher.shutdown();
    orchestrator_token.cancel();
    let _ = orchestrator_task.await;
    scheduler.shutdown().await;

    logger.info("host stopped", json!({}));
    logger.flush().await;
    info!("orderly shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("cannot install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
