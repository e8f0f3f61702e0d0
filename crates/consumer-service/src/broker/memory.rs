use super::{BrokerClient, BrokerEvent, Msg, PartitionOffset};
use async_trait::async_trait;
use shared_lib::{CoordError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct State {
    events: VecDeque<BrokerEvent>,
    commits: Vec<Vec<PartitionOffset>>,
    fail_commits: bool,
}

/// 进程内的 [`BrokerClient`] 实现
///
/// 事件按写入顺序被拉取，所有提交都会被记录下来，方便在测试中断言。
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 写入一条消息
    pub fn send(&self, partition: i32, offset: i64, key: impl Into<String>, value: impl Into<String>) {
        self.push_event(BrokerEvent::Message(Msg {
            key: key.into(),
            value: value.into(),
            partition,
            offset,
        }));
    }

    pub fn push_event(&self, event: BrokerEvent) {
        self.lock().events.push_back(event);
    }

    /// 所有成功的提交，按提交顺序排列
    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.lock().commits.clone()
    }

    /// 某个分区最近一次提交的offset
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.lock()
            .commits
            .iter()
            .flatten()
            .filter(|it| it.partition == partition)
            .map(|it| it.offset)
            .last()
    }

    /// 打开后所有提交都会失败
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn poll(&self, timeout: Duration) -> Option<BrokerEvent> {
        if let Some(event) = self.lock().events.pop_front() {
            return Some(event);
        }

        tokio::time::sleep(timeout).await;
        self.lock().events.pop_front()
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<()> {
        let mut state = self.lock();

        if state.fail_commits {
            return Err(CoordError::broker("commit rejected by memory broker"));
        }

        state.commits.push(offsets.to_vec());
        Ok(())
    }
}
