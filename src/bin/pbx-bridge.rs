//! PBX bridge daemon: AMI connection, queue and health monitors, webhook
//! ingress.
//!
//! Usage: `pbx-bridge [config.toml]` (or `PBX_BRIDGE_CONFIG`). Every setting
//! can be overridden with `PBX_BRIDGE_<SECTION>__<KEY>` variables. Logging
//! follows `RUST_LOG` (default `info`).

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use asterisk_ami_tokio::queue::LogAlertSink;
use asterisk_ami_tokio::webhook::http::{router, AppState};
use asterisk_ami_tokio::webhook::{
    IdempotencyStore, InMemoryIdempotencyStore, InMemoryRateLimiter, LogCrmSink, SqliteIdempotencyStore,
};
use asterisk_ami_tokio::{AmiClient, BridgeConfig, HealthMonitor, QueueMonitor, WebhookIngress};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often expired rate-limit windows and dedup records are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("PBX_BRIDGE_CONFIG"))
        .map(PathBuf::from);
    let config = BridgeConfig::load(path.as_deref())?;
    info!(
        "Connecting to {}:{} as {}",
        config.ami.host, config.ami.port, config.ami.username
    );

    let client = AmiClient::connect(config.ami_options()).await?;
    info!("Connected: {}", client.greeting().unwrap_or_default());

    let queues = if config.queues.enabled {
        let monitor = Arc::new(
            QueueMonitor::new(client.clone(), config.queue_config()).with_alert_sink(Arc::new(LogAlertSink)),
        );
        monitor.spawn();
        Some(monitor)
    } else {
        None
    };

    let health = if config.health.enabled {
        let mut monitor = HealthMonitor::new(client.clone(), config.health_config());
        if let Some(queues) = &queues {
            monitor = monitor.with_queue_monitor(Arc::clone(queues));
        }
        let (reports, _task) = Arc::new(monitor).spawn(config.health_interval());
        Some(reports)
    } else {
        None
    };

    if config.webhooks.enabled {
        let limiter = Arc::new(InMemoryRateLimiter::new());
        let dedup: Arc<dyn IdempotencyStore> = match &config.webhooks.dedup_path {
            Some(path) => {
                info!("Webhook dedup records stored in {}", path.display());
                Arc::new(SqliteIdempotencyStore::open(path, config.dedup_retention()).await?)
            }
            None => Arc::new(InMemoryIdempotencyStore::new(config.dedup_retention())),
        };
        let ingress = Arc::new(WebhookIngress::new(
            config.providers(),
            limiter.clone(),
            dedup.clone(),
            Arc::new(LogCrmSink),
        ));
        info!("Webhook providers: {:?}", ingress);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                ticker
                    .tick()
                    .await;
                limiter.purge(PURGE_INTERVAL);
                if let Err(e) = dedup
                    .purge_expired()
                    .await
                {
                    warn!("Dedup purge failed: {}", e);
                }
            }
        });

        let mut state = AppState::new(ingress).with_trusted_proxies(config.trusted_proxies());
        if let Some(reports) = health {
            state = state.with_health(reports);
        }
        let listener = TcpListener::bind(&config.webhooks.listen).await?;
        info!("Webhook ingress listening on {}", config.webhooks.listen);
        axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    } else {
        shutdown_signal().await;
    }

    client
        .shutdown()
        .await?;
    Ok(())
}
