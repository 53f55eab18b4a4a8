use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cchelm::{HelmConfig, HelmError, Orchestrator};

/// cchelm - multi-session orchestrator for interactive AI CLIs
#[derive(Parser)]
#[command(name = "cchelm")]
#[command(about = "Multi-session orchestrator for interactive AI CLIs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and its HTTP API
    Serve {
        /// Listen address (overrides CCHELM_BIND)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Print the effective configuration and exit
        #[arg(long)]
        dump_config: bool,
    },
}

const EXIT_USAGE: u8 = 64;
const EXIT_INTERNAL: u8 = 70;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("CCHELM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(EXIT_INTERNAL))
        }
    }
}

async fn run(cli: Cli) -> Result<(), HelmError> {
    match cli.command {
        Commands::Serve { bind, dump_config } => serve(bind, dump_config).await,
    }
}

async fn serve(bind: Option<SocketAddr>, dump_config: bool) -> Result<(), HelmError> {
    let mut config = HelmConfig::from_env();
    if let Some(addr) = bind {
        config.bind_addr = addr;
    }

    if dump_config {
        let rendered = serde_json::to_string_pretty(&config)
            .map_err(|e| HelmError::internal(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    let bind_addr = config.bind_addr;
    let orchestrator = Orchestrator::bootstrap(config).await?;
    let recovered = orchestrator.recover().await?;
    info!(recovered, "recovery pass complete");

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| HelmError::BackendUnavailable(format!("bind {}: {}", bind_addr, e)))?;
    info!(addr = %bind_addr, "API listening");

    let app = cchelm::api::router(orchestrator.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| HelmError::internal(format!("server error: {}", e)))?;

    orchestrator.shutdown().await;
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
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
