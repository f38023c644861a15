use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use event_relay::app::Pipeline;
use event_relay::config::PipelineConfig;

/// Console logging always; a daily-rolling file when `dir` is set.
fn init_tracing(dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "event-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📨 Event Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Domain: {}", config.domain);
    match &config.db_path {
        Some(path) => eprintln!("   Database: {}", path.display()),
        None => eprintln!("   Database: in-memory"),
    }
    eprintln!("   Ingress: http://0.0.0.0:{}/", config.port);
    eprintln!("   Monitor: ws://0.0.0.0:{}/monitor/ws", config.port);

    let pipeline = Pipeline::open(&config).await.context("failed to start pipeline")?;
    let app = pipeline.router();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    pipeline.shutdown().await;
    Ok(())
}
