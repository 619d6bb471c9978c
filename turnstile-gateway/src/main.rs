//! Gateway entry point.

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use turnstile_gateway::{Config, Gateway, LogFormat, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(env_filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let shutdown = CancellationToken::new();
    let gateway = Gateway::build(&config, shutdown.clone())?;

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind { addr: addr.clone(), source })?;

    let sweeper = gateway.spawn_sweeper();
    tokio::spawn(watch_signals(shutdown.clone()));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        upstream = %config.upstream_url,
        "gateway listening"
    );

    let served =
        turnstile_gateway::serve(listener, gateway.router(), shutdown.clone(), config.shutdown_timeout)
            .await;

    // A serve error must still stop the sweeper.
    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    gateway.log_stats();
    tracing::info!("gateway shut down");

    served.map_err(StartupError::Serve)
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => return,
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
