//! 基于rdkafka的 [`BrokerClient`] 实现
//!
//! 自动提交被关闭，offset只会在批量回调成功后由 [`crate::batch_consumer::BatchCommitConsumer`] 提交。
//!
//! 分区重平衡由librdkafka在回调中完成分配/回收，这里的 [`RebalanceContext`] 只负责打印日志，
//! 并把分配结果作为 [`BrokerEvent`] 转发给拉取协程。

use super::{BrokerClient, BrokerEvent, Msg, PartitionOffset};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use shared_lib::{CoordError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

pub struct RebalanceContext {
    topic: String,
    group_id: String,
    events_tx: UnboundedSender<BrokerEvent>,
}

impl RebalanceContext {
    fn partitions(&self, tpl: &TopicPartitionList) -> Vec<i32> {
        tpl.elements()
            .iter()
            .filter(|elem| elem.topic() == self.topic)
            .map(|elem| elem.partition())
            .collect()
    }

    fn forward(&self, event: BrokerEvent) {
        if self.events_tx.send(event).is_err() {
            warn!("Rebalance event dropped: Topic={}, GroupId={}", self.topic, self.group_id);
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = self.partitions(tpl);
            info!(
                "Partition revoked: Topic={}, GroupId={}, Partitions={:?}",
                self.topic, self.group_id, partitions
            );
            self.forward(BrokerEvent::Revoked(partitions));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = self.partitions(tpl);
                info!(
                    "Partition assigned: Topic={}, GroupId={}, Partitions={:?}",
                    self.topic, self.group_id, partitions
                );
                self.forward(BrokerEvent::Assigned(partitions));
            }
            Rebalance::Error(err) => {
                error!("Rebalance failed: Topic={}, GroupId={}, Error={}", self.topic, self.group_id, err);
            }
            Rebalance::Revoke(_) => {}
        }
    }
}

pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    rebalance_rx: Mutex<UnboundedReceiver<BrokerEvent>>,
}

impl KafkaBroker {
    /// 创建消费者并订阅 `topic`
    ///
    /// `start_offset` 对应 `auto.offset.reset`，只在消费者组没有已提交offset时生效
    pub fn connect(brokers: &str, group_id: &str, topic: &str, start_offset: &str) -> Result<Self> {
        let (events_tx, rebalance_rx) = mpsc::unbounded_channel();

        let context = RebalanceContext {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            events_tx,
        };

        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", start_offset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("fetch.min.bytes", (1024 * 1024).to_string())
            .set("fetch.wait.max.ms", "100")
            .set("max.partition.fetch.bytes", (4 * 1024 * 1024).to_string())
            .set("queued.min.messages", "100")
            .set("queued.max.messages.kbytes", "65536")
            .create_with_context(context)
            .map_err(|err| CoordError::broker(format!("create kafka consumer failed: {err}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|err| CoordError::broker(format!("subscribe topic {topic} failed: {err}")))?;

        info!(
            "创建了一个 kafka 消费者: Topic={}, GroupId={}, Broker={}, StartOffset={}",
            topic, group_id, brokers, start_offset
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            rebalance_rx: Mutex::new(rebalance_rx),
        })
    }

    fn next_rebalance_event(&self) -> Option<BrokerEvent> {
        self.rebalance_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .try_recv()
            .ok()
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn poll(&self, timeout: Duration) -> Option<BrokerEvent> {
        if let Some(event) = self.next_rebalance_event() {
            return Some(event);
        }

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => self.next_rebalance_event(),
            Ok(Err(err)) => Some(BrokerEvent::Error(err.to_string())),
            Ok(Ok(message)) => Some(BrokerEvent::Message(Msg {
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned())
                    .unwrap_or_default(),
                value: message
                    .payload()
                    .map(|payload| String::from_utf8_lossy(payload).into_owned())
                    .unwrap_or_default(),
                partition: message.partition(),
                offset: message.offset(),
            })),
        }
    }

    /// 同步提交会阻塞一个网络往返，放到阻塞线程池里执行，单线程运行时同样可用
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<()> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for it in offsets {
            tpl.add_partition_offset(&it.topic, it.partition, Offset::Offset(it.offset))
                .map_err(|err| CoordError::broker(err.to_string()))?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|err| CoordError::broker(format!("commit task failed: {err}")))?
            .map_err(|err| CoordError::broker(format!("commit offsets failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brokers() -> String {
        std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())
    }

    // 默认的 #[tokio::test] 是单线程运行时
    #[tokio::test]
    #[ignore = "requires a running kafka"]
    async fn test_commit_on_current_thread_runtime() {
        let broker = KafkaBroker::connect(&brokers(), "commit-test-group", "commit-test", "earliest").unwrap();

        let _ = broker.poll(Duration::from_millis(500)).await;

        // 分区可能还没有分配，提交失败也只能返回错误，不能让运行时panic
        let result = broker
            .commit(&[PartitionOffset {
                topic: "commit-test".to_string(),
                partition: 0,
                offset: 1,
            }])
            .await;

        if let Err(err) = result {
            assert!(err.to_string().contains("commit offsets failed"), "{err}");
        }
    }
}
