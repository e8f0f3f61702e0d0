//! 定时生成工作项并写入有界队列
//!
//! 队列已满时本次生成的工作项直接丢弃，等待下一次触发，不会阻塞调度器。

use crate::leased::JobTask;
use chrono::Utc;
use color_eyre::Result;
use futures::FutureExt;
use shared_lib::BoundedQueue;
use std::sync::Arc;
use tracing::{info, instrument};

pub const JOB_ID: &str = "coord_backend:cron:enqueue_work_items";

/// 每次触发生成的工作项个数
pub const ITEMS_PER_TICK: u64 = 10;

/// 执行一次：生成 [`ITEMS_PER_TICK`] 个工作项，返回写入的个数
#[instrument(skip(queue))]
pub async fn execute_once(queue: &BoundedQueue<u64>, tick_key: &str) -> Result<i64> {
    // 毫秒时间戳 * 1000 + 序号，同一毫秒内最多生成1000个不重复的ID
    let base = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default() * 1000;
    let items: Vec<u64> = (0..ITEMS_PER_TICK).map(|i| base + i).collect();

    let pushed = queue.push(&items).await?;
    if pushed > 0 {
        info!("⏰ 工作项已加入队列: Key={}, Count={}", queue.key(), pushed);
    }

    Ok(pushed)
}

pub fn task(queue: Arc<BoundedQueue<u64>>) -> JobTask {
    Arc::new(move |tick_key: String| {
        let queue = Arc::clone(&queue);
        async move { execute_once(&queue, &tick_key).await.map(|_| ()) }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_lib::{MemoryStore, ScriptedStore};

    #[tokio::test]
    async fn test_full_queue_drops_whole_tick() {
        let store: Arc<dyn ScriptedStore> = Arc::new(MemoryStore::new());
        let queue = BoundedQueue::<u64>::new(store, "test:work", 15).unwrap();

        assert_eq!(execute_once(&queue, "tick#1").await.unwrap(), 10);
        assert_eq!(execute_once(&queue, "tick#2").await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_items_are_unique_within_tick() {
        let store: Arc<dyn ScriptedStore> = Arc::new(MemoryStore::new());
        let queue = BoundedQueue::<u64>::new(store, "test:work", 100).unwrap();

        execute_once(&queue, "tick#1").await.unwrap();

        let mut items = queue.pop(100).await.unwrap();
        items.dedup();
        assert_eq!(items.len(), ITEMS_PER_TICK as usize);
        assert_eq!(queue.max_val().await.unwrap(), items.last().copied());
    }
}
