use crate::broker::Msg;
use async_trait::async_trait;
use color_eyre::Result;
use shared_lib::QueueValue;

/// 批量消息处理器特征
///
/// 处理器会被移动到后台协程中执行，因此需要实现线程安全的[`Send`]和[`Sync`]。
///
/// - 返回 `Ok` 之后这一批消息的offset才会被提交
/// - 返回 `Err` 时这一批消息**不会被提交也不会重试**，消费者继续处理后续消息
///
/// 同一条消息可能被处理多次（至少一次语义），实现时需要保证幂等。
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, topic: &str, group_id: &str, batch: &[Msg]) -> Result<()>;
}

/// 有界队列元素处理器特征
///
/// 元素在交给处理器之前已经从队列中删除，处理失败只会打印日志
#[async_trait]
pub trait QueueHandler<T: QueueValue>: Send + Sync {
    async fn handle_items(&self, worker_name: &str, items: Vec<T>) -> Result<()>;
}
