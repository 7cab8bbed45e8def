//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::server;
use crate::state::AppState;
use crate::tunnel::{ClientConfig, ClientManager};

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        public_addr = %config.public_addr,
        admin_addr = %config.admin_addr,
        "tunnelbroker starting"
    );

    let tunnel_port_range = config.parsed_tunnel_port_range()?;
    let client_config = ClientConfig {
        max_tcp_sockets: config.max_tcp_sockets,
        grace_period: std::time::Duration::from_millis(config.grace_period_ms),
        tunnel_port_range,
    };

    let state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        manager: ClientManager::new(client_config),
    });

    let public_listener = TcpListener::bind(&config.public_addr).await?;
    let admin_listener = TcpListener::bind(&config.admin_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let public_state = Arc::clone(&state);
    let public_shutdown = shutdown_rx.clone();
    let public_handle = tokio::spawn(async move {
        server::serve(public_listener, public_state, public_shutdown, |state, req| async move {
            server::public::handle(state, req).await
        })
        .await;
    });

    let admin_state = Arc::clone(&state);
    let admin_shutdown = shutdown_rx.clone();
    let admin_handle = tokio::spawn(async move {
        server::serve(admin_listener, admin_state, admin_shutdown, |state, req| async move {
            server::admin::handle(state, req).await
        })
        .await;
    });

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    state.manager.close_all().await;

    let _ = public_handle.await;
    let _ = admin_handle.await;

    info!("tunnelbroker stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{reload, EnvFilter};

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, _reload_handle) = reload::Layer::new(filter);

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
