//! rx-server — HTTP front-end for the rx engine.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use rx_core::Config;
use rx_http::{router, AppContext};

/// HTTP API server for rx: scan, analyse, index, and compress log files.
#[derive(Parser)]
#[command(name = "rx-server", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "8181")]
    port: u16,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,

    /// Allowed search root (repeatable; overrides RX_SEARCH_ROOTS)
    #[arg(long = "root")]
    roots: Vec<PathBuf>,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rx=info".parse().expect("static directive")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if !cli.roots.is_empty() {
        config.search_roots = cli.roots.clone();
    }

    let ctx = match AppContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to initialize: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "serving {} root(s), cache at {}",
        ctx.sandbox.roots().len(),
        ctx.config.cache_dir.display()
    );

    let host = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{host}:{}", cli.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("listening on http://{addr}");

    if let Err(e) = axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
