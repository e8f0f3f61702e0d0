use crate::leased::JobTask;
use color_eyre::Result;
use futures::FutureExt;
use shared_lib::BoundedQueue;
use std::sync::Arc;
use tracing::{info, warn};

pub const JOB_ID: &str = "coord_backend:cron:queue_report";

/// 队列使用率超过这个比例时打印警告
const HIGH_USAGE_PERCENT: i64 = 80;

/// 打印队列长度、使用率和最高水位，返回当前长度
pub async fn execute_once(queue: &BoundedQueue<u64>, tick_key: &str) -> Result<i64> {
    let len = queue.len().await?;
    let max_val = queue.max_val().await?;
    let usage = len * 100 / queue.max_count();

    if usage >= HIGH_USAGE_PERCENT {
        warn!(
            "📈 队列使用率过高: Key={}, Len={}, MaxCount={}, Usage={}%, MaxVal={:?}, TickKey={}",
            queue.key(),
            len,
            queue.max_count(),
            usage,
            max_val,
            tick_key
        );
    } else {
        info!(
            "📊 队列状态: Key={}, Len={}, MaxCount={}, Usage={}%, MaxVal={:?}, TickKey={}",
            queue.key(),
            len,
            queue.max_count(),
            usage,
            max_val,
            tick_key
        );
    }

    Ok(len)
}

pub fn task(queue: Arc<BoundedQueue<u64>>) -> JobTask {
    Arc::new(move |tick_key: String| {
        let queue = Arc::clone(&queue);
        async move { execute_once(&queue, &tick_key).await.map(|_| ()) }.boxed()
    })
}
