//! Sight Launcher
//!
//! Loads an application document, runs it until Ctrl+C or a given
//! duration, then stops and destroys it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sight::modules::register_builtin_modules;
use sight::settings::{LogSettings, Settings};
use sight_service::{AppConfigManager, ApplicationContext, Parameters};

/// Sight application launcher
#[derive(Parser, Debug)]
#[command(name = "sight")]
#[command(about = "Run a Sight application", long_about = None)]
struct Args {
    /// Application document, or its name under the settings' apps directory
    #[arg(required_unless_present = "list_types")]
    app: Option<PathBuf>,

    /// Application parameter, may be repeated
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// List the registered service and data types, then exit
    #[arg(long)]
    list_types: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load(args.settings.as_deref()).context("Failed to load settings")?;
    init_tracing(&settings.log);

    info!("Starting Sight v{}", env!("CARGO_PKG_VERSION"));

    let app = ApplicationContext::new().context("Failed to create the application context")?;
    register_builtin_modules(&app);

    if args.list_types {
        for name in app.service_factory().types() {
            println!("service  {name}");
        }
        for name in app.data_factory().types() {
            println!("data     {name}");
        }
        app.shutdown();
        return Ok(());
    }

    let Some(app_arg) = args.app.as_deref() else {
        anyhow::bail!("no application given");
    };
    let path = settings.resolve_app(app_arg);
    let params: Parameters = args.params.into_iter().collect();

    info!("Loading application from: {}", path.display());
    let manager = match AppConfigManager::load(&app, &path, &params) {
        Ok(manager) => manager,
        Err(e) => {
            app.shutdown();
            return Err(e).with_context(|| format!("Failed to load {}", path.display()));
        }
    };

    if let Err(e) = manager.launch() {
        error!("Failed to launch application {}: {}", manager.id(), e);
        if let Err(e) = manager.stop_and_destroy() {
            warn!("Cleanup after failed launch: {}", e);
        }
        app.shutdown();
        return Err(e).context("Failed to launch the application");
    }
    info!("Application {} running", manager.id());

    // Services run on their own workers; the runtime only waits for the end
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?
        .block_on(shutdown_signal(args.duration.map(Duration::from_secs)));

    info!("Stopping application {}", manager.id());
    let result = manager.stop_and_destroy();
    app.shutdown();
    result.context("Failed to stop the application cleanly")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl+C, SIGTERM or the end of the duration
async fn shutdown_signal(duration: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
        _ = elapsed => {
            info!("Run duration elapsed, shutting down...");
        },
    }
}
