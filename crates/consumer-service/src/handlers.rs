use crate::broker::Msg;
use crate::traits::{BatchHandler, QueueHandler};
use async_trait::async_trait;
use color_eyre::Result;
use serde::Deserialize;
use tracing::{debug, trace, warn};

/// 事件消息格式
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub event_id: u64,

    #[serde(default)]
    pub kind: String,
}

/// [DEMO] 批量事件处理器，只打印日志
///
/// 无法解析的消息会被跳过，不会导致整批提交失败
pub struct EventBatchLogger;

#[async_trait]
impl BatchHandler for EventBatchLogger {
    async fn handle_batch(&self, topic: &str, group_id: &str, batch: &[Msg]) -> Result<()> {
        let mut parsed = Vec::with_capacity(batch.len());

        for msg in batch {
            trace!("[DEMO]handle event raw {}", msg.value);

            match serde_json::from_str::<EventPayload>(&msg.value) {
                Ok(event) => parsed.push(event),
                Err(err) => warn!(
                    "[DEMO]skip invalid event: Partition={}, Offset={}, Error={}",
                    msg.partition, msg.offset, err
                ),
            }
        }

        debug!(
            "[DEMO]handle event batch: Topic={}, GroupId={}, Received={}, Parsed={}",
            topic,
            group_id,
            batch.len(),
            parsed.len()
        );

        Ok(())
    }
}

/// [DEMO] 有界队列元素处理器，只打印日志
pub struct WorkItemLogger;

#[async_trait]
impl QueueHandler<u64> for WorkItemLogger {
    async fn handle_items(&self, worker_name: &str, items: Vec<u64>) -> Result<()> {
        debug!("[DEMO]{} handle work items {:?}", worker_name, items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_events_do_not_fail_batch() {
        let batch = vec![
            Msg {
                key: "a".to_string(),
                value: r#"{"event_id": 1, "kind": "created"}"#.to_string(),
                partition: 0,
                offset: 0,
            },
            Msg {
                key: "b".to_string(),
                value: "not json".to_string(),
                partition: 0,
                offset: 1,
            },
        ];

        assert!(EventBatchLogger.handle_batch("events", "group", &batch).await.is_ok());
    }
}
