use color_eyre::eyre::Context;
use color_eyre::Result;
use consumer_service::{start_event_consumer, start_work_item_workers};
use cronjob_service::start_cron_tasks;
use shared_lib::{connect_store, AppConfig, BoundedQueue};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::try_join;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| tracing::Level::from_str(&level).ok())
        .unwrap_or(tracing::Level::DEBUG);

    tracing_subscriber::fmt().with_max_level(log_level).init();

    info!("🚀 启动 coord-backend...");

    let app_config = AppConfig::load()?;

    let store = connect_store(&app_config.redis)
        .await
        .context("Connect to coordination store")?;

    let queue = Arc::new(
        BoundedQueue::<u64>::new(Arc::clone(&store), app_config.queue.key.clone(), app_config.queue.max_count)
            .context("Create bounded work queue")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("📴 收到关闭信号，开始退出...");
        if shutdown_tx.send(true).is_err() {
            warn!("All services already stopped");
        }
    });

    try_join!(
        start_cron_tasks(Arc::clone(&store), Arc::clone(&queue), shutdown_rx.clone()),
        start_work_item_workers(Arc::clone(&app_config), Arc::clone(&queue), shutdown_rx.clone()),
        start_event_consumer(Arc::clone(&app_config), shutdown_rx.clone()),
    )?;

    info!("✅ coord-backend 已停止");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!("Failed to listen SIGTERM: {}", err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
