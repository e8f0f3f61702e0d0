use crate::traits::QueueHandler;
use color_eyre::eyre::Context;
use color_eyre::Result;
use futures::future::try_join_all;
use shared_lib::models::constants::QUEUE_IDLE_SLEEP_MILLIS;
use shared_lib::{BoundedQueue, QueueValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tracing::{debug, error, info, warn};

/// 启动有界队列消费协程
///
/// ## 参数说明
/// - `queue`: 需要消费的有界队列
/// - `workers`: 并发的消费协程个数
/// - `pop_batch`: 每个协程单次最多取出的元素个数
/// - `handler`: 业务处理器
/// - `shutdown_rx`: 用于接收关闭信号
///
/// 取出操作本身是原子的，多个协程（以及多个进程）之间不会拿到同一个元素，
/// 因此这里不需要任何锁。
pub async fn start_queue_workers<T, H>(
    queue: Arc<BoundedQueue<T>>,
    workers: usize,
    pop_batch: usize,
    handler: Arc<H>,
    shutdown_rx: Receiver<bool>,
) -> Result<()>
where
    T: QueueValue,
    H: QueueHandler<T> + 'static,
{
    info!(
        "Starting bounded queue workers: Key={}, Workers={}, PopBatch={}",
        queue.key(),
        workers,
        pop_batch
    );

    let idle_sleep = Duration::from_millis(QUEUE_IDLE_SLEEP_MILLIS);

    let workers: Vec<_> = (0..workers.max(1))
        .map(|i| {
            queue_worker(
                Arc::clone(&queue),
                format!("{}_{}", queue.key(), i),
                pop_batch.max(1),
                idle_sleep,
                Arc::clone(&handler),
                shutdown_rx.clone(),
            )
        })
        .collect();

    try_join_all(workers)
        .await
        .context(format!("wait for all queue workers [{}] end", queue.key()))?;

    info!("Bounded queue workers stopped: Key={}", queue.key());

    Ok(())
}

async fn queue_worker<T, H>(
    queue: Arc<BoundedQueue<T>>,
    worker_name: String,
    pop_batch: usize,
    idle_sleep: Duration,
    handler: Arc<H>,
    mut shutdown_rx: Receiver<bool>,
) -> Result<()>
where
    T: QueueValue,
    H: QueueHandler<T>,
{
    debug!("Queue worker {} started", worker_name);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let sleep = match queue.pop(pop_batch).await {
            Ok(items) if items.is_empty() => idle_sleep,
            Ok(items) => {
                if let Err(err) = handler.handle_items(&worker_name, items).await {
                    error!("{} failed to handle queue items: {:?}", worker_name, err);
                }
                continue;
            }
            Err(err) => {
                warn!("{} pop failed, err: {}, retrying...", worker_name, err);
                Duration::from_secs(5)
            }
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    debug!("Queue worker {} stopped", worker_name);

    Ok(())
}
