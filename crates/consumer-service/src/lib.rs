//! 消费者服务模块
//!
//! 这个模块提供了两类消费者：
//!
//! - [`batch_consumer::BatchCommitConsumer`]: 从消息中间件批量消费，回调成功后才提交offset
//! - [`queue_worker::start_queue_workers`]: 多个协程并发消费同一个有界队列

pub mod batch_consumer;
pub mod broker;
pub mod handlers;
pub mod queue_worker;
pub mod traits;

pub use batch_consumer::{BatchCommitConsumer, ConsumerOptions, ConsumerStats};
pub use broker::{BrokerClient, BrokerEvent, MemoryBroker, Msg, PartitionOffset};
pub use traits::{BatchHandler, QueueHandler};

use self::handlers::WorkItemLogger;
use color_eyre::Result;
use shared_lib::models::config::AppConfig;
use shared_lib::BoundedQueue;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tracing::{info, warn};

/// 启动有界队列的消费协程
///
/// 协程个数和单次取出的元素个数来自 [`AppConfig`] 中的队列配置
pub async fn start_work_item_workers(
    app_config: Arc<AppConfig>,
    queue: Arc<BoundedQueue<u64>>,
    shutdown_rx: Receiver<bool>,
) -> Result<()> {
    queue_worker::start_queue_workers(
        queue,
        app_config.queue.workers,
        app_config.queue.pop_batch,
        Arc::new(WorkItemLogger),
        shutdown_rx,
    )
    .await
}

/// 启动kafka批量消费者
///
/// 连接失败时每隔5秒重试一次，直到成功或者收到关闭信号
#[cfg(feature = "kafka")]
pub async fn start_event_consumer(app_config: Arc<AppConfig>, mut shutdown_rx: Receiver<bool>) -> Result<()> {
    use self::broker::kafka::KafkaBroker;
    use self::handlers::EventBatchLogger;

    let kafka = &app_config.kafka;

    info!(
        "Starting kafka batch consumer with broker {}, topic {}, group {}...",
        kafka.brokers, kafka.topic, kafka.group_id
    );

    let connect = || KafkaBroker::connect(&kafka.brokers, &kafka.group_id, &kafka.topic, &kafka.offset_reset);
    let Some(broker) = connect_with_retry(connect, RECONNECT_INTERVAL, &mut shutdown_rx).await else {
        info!("Kafka batch consumer not started, shutdown received while connecting");
        return Ok(());
    };

    let consumer = BatchCommitConsumer::new(
        broker,
        kafka.topic.clone(),
        kafka.group_id.clone(),
        ConsumerOptions::from(kafka),
    );

    consumer.run(Arc::new(EventBatchLogger), shutdown_rx).await
}

#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// 反复调用 `connect` 直到成功，收到关闭信号时返回 `None`
///
/// 两次重试之间的等待同样会被关闭信号打断
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
async fn connect_with_retry<T, E: Display>(
    mut connect: impl FnMut() -> std::result::Result<T, E>,
    retry_interval: Duration,
    shutdown_rx: &mut Receiver<bool>,
) -> Option<T> {
    loop {
        if *shutdown_rx.borrow() {
            return None;
        }

        match connect() {
            Ok(client) => return Some(client),
            Err(err) => {
                warn!("{}", err);
                warn!("Failed to start kafka batch consumer, retrying...");
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

/// 未开启 `kafka` 特性时不启动批量消费者
#[cfg(not(feature = "kafka"))]
pub async fn start_event_consumer(app_config: Arc<AppConfig>, _shutdown_rx: Receiver<bool>) -> Result<()> {
    info!(
        "Kafka feature disabled, batch consumer for topic {} not started",
        app_config.kafka.topic
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_stops_on_shutdown() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut attempts = 0;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = shutdown_tx.send(true);
        });

        let started = Instant::now();
        let client: Option<()> = connect_with_retry(
            || {
                attempts += 1;
                Err::<(), _>("broker unreachable")
            },
            RECONNECT_INTERVAL,
            &mut shutdown_rx,
        )
        .await;

        assert!(client.is_none());
        assert_eq!(attempts, 1);
        assert!(started.elapsed() < RECONNECT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_until_success() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut attempts = 0;

        let started = Instant::now();
        let client = connect_with_retry(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err("broker unreachable")
                } else {
                    Ok(attempts)
                }
            },
            RECONNECT_INTERVAL,
            &mut shutdown_rx,
        )
        .await;

        assert_eq!(client, Some(3));
        assert!(started.elapsed() >= RECONNECT_INTERVAL * 2);
    }
}
