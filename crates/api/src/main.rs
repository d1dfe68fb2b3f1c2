use anyhow::Context;
use tracing::info;

use hireloop_api::app::{AppState, build_app, build_services};
use hireloop_api::bridge::{FanoutBridge, OriginPolicy};
use hireloop_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hireloop_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let mut services = build_services(&config)
        .await
        .context("failed to initialize services")?;

    let bridge = FanoutBridge::start(services.bus.as_ref(), services.registry.clone())
        .await
        .context("failed to subscribe to the queue channel")?;
    let worker = services.spawn_worker(&config);

    let state = AppState {
        services,
        origins: OriginPolicy::new(&config.allowed_origins),
        worker: worker.as_ref().map(|w| w.worker()),
    };
    let app = build_app(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            if let Some(worker) = worker {
                worker.shutdown().await;
            }
            bridge.shutdown().await;
        })
        .await
        .context("server error")?;

    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
