//! 消息中间件抽象
//!
//! 批量消费者只依赖 [`BrokerClient`] 特征：拉取一条事件、提交一组offset。
//!
//! - `kafka` 特性打开时提供基于rdkafka的 [`kafka::KafkaBroker`]
//! - [`MemoryBroker`] 是进程内实现，主要用于测试和本地调试

#[cfg(feature = "kafka")]
pub mod kafka;
mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use std::time::Duration;

/// 从broker收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub key: String,
    pub value: String,
    pub partition: i32,
    pub offset: i64,
}

/// 拉取到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message(Msg),

    /// broker报告的错误，消费者只打印日志，不会退出
    Error(String),

    /// 分区重平衡：新分配到的分区
    Assigned(Vec<i32>),

    /// 分区重平衡：被收回的分区
    Revoked(Vec<i32>),
}

/// 需要提交的offset，`offset` 是下一条要消费的消息位置（已处理的最大offset + 1）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// 最多等待 `timeout`，超时返回 `None`
    async fn poll(&self, timeout: Duration) -> Option<BrokerEvent>;

    /// 同步提交offset，返回时broker已经确认（或者失败）
    async fn commit(&self, offsets: &[PartitionOffset]) -> shared_lib::Result<()>;
}
