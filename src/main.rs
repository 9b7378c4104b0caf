use std::{net::SocketAddr, path::Path};

use clap::Parser;
use color_eyre::eyre::{eyre, Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{Compact, DefaultFields};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    config::Config,
    store::Store,
    web_api::{get_api_router, rate_limit::RateLimiter},
};

mod config;
mod prediction;
mod store;
#[cfg(test)]
mod testing;
mod web_api;

fn get_layer<S>(
    layer: tracing_subscriber::fmt::Layer<S>,
) -> tracing_subscriber::fmt::Layer<
    S,
    DefaultFields,
    tracing_subscriber::fmt::format::Format<Compact, ChronoLocal>,
> {
    layer
        .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
        .compact()
}

/// Stdout logging, mirrored to `log_file` when given. The guard must outlive the server.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let log_level = std::env::var("LOG").unwrap_or("info".to_owned());
    let tracing_opts = tracing_subscriber::registry()
        .with(
            EnvFilter::new(format!("prediction_board={log_level}"))
                .add_directive(format!("tower_http::trace={log_level}").parse()?),
        )
        .with(get_layer(tracing_subscriber::fmt::layer()));

    let Some(log_file) = log_file else {
        tracing_opts.init();
        return Ok(None);
    };

    let file_name = log_file
        .file_name()
        .ok_or_else(|| eyre!("Log file has no file name: {}", log_file.display()))?;
    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_opts
        .with(
            get_layer(tracing_subscriber::fmt::layer())
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let config = Config::parse();
    let _guard = init_tracing(config.log_file.as_deref()).context("Setting up logging")?;

    let store = Store::connect(&config.database_url, config.pool_size)
        .context("Connecting to database")?;
    info!("Database ready at {}", config.database_url);

    if config.admin_key().is_none() {
        warn!("ADMIN_KEY is not set, anyone can delete every prediction");
    }

    let router = get_api_router(
        store,
        config.admin_key().map(str::to_owned),
        &config.cors_origin,
        RateLimiter::default(),
    );

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Binding {}:{}", config.host, config.port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Web API")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!("Could not listen for SIGTERM: {err}");
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
    info!("Shutting down");
}
