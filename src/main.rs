use std::sync::Arc;

use anyhow::Result;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ara_notification_dispatcher::config::Settings;
use ara_notification_dispatcher::metrics::Metrics;
use ara_notification_dispatcher::notification::{Manager, StoreEnqueuer};
use ara_notification_dispatcher::postgres::PostgresPool;
use ara_notification_dispatcher::server::{create_app, AppState};
use ara_notification_dispatcher::store::create_store;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let postgres_pool = if settings.store.backend == "postgres" {
        Some(Arc::new(PostgresPool::new(&settings.database).await?))
    } else {
        None
    };

    let store = create_store(&settings.store, postgres_pool.clone());
    tracing::info!(backend = store.backend_type(), "Store initialized");

    let registry = Arc::new(Registry::new());
    let metrics = Metrics::new(&registry)?;

    let notifications = settings.notifications.clone();
    let manager = Arc::new(Manager::new(notifications.clone(), store.clone(), metrics)?);
    let enqueuer = Arc::new(StoreEnqueuer::new(store.clone(), &notifications));

    // Cancelling this abandons in-flight work; graceful shutdown goes
    // through `Manager::stop` first.
    let ctx = CancellationToken::new();
    let manager_handle = {
        let manager = manager.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run(ctx, notifications.notifiers).await {
                tracing::error!(error = %e, "Notification manager exited with error");
            }
        })
    };

    let state = AppState::new(settings.clone(), store, manager.clone(), enqueuer, registry)
        .with_postgres_pool(postgres_pool.clone());
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    tracing::info!("Stopping notification manager...");
    if let Err(e) = manager.stop(settings.notifications.stop_timeout()).await {
        tracing::warn!(error = %e, "Notification manager did not stop cleanly");
    }
    ctx.cancel();
    let _ = manager_handle.await;

    if let Some(pool) = postgres_pool {
        pool.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
