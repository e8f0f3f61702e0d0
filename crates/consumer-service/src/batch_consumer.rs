//! 批量提交消费者
//!
//! 把"逐条收消息"和"批量提交offset"拆成两个协程：
//!
//! ```text
//!  broker ──poll──▶ [拉取协程] ──mpsc(有界)──▶ [提交协程] ──▶ BatchHandler
//!                                                   │
//!                                                   └── 回调成功后按分区提交 max(offset)+1
//! ```
//!
//! - 缓冲区达到 `batch_size` 时立即提交一批
//! - 每隔 `commit_flush_interval`，缓冲区不为空也会提交一批
//! - 回调失败时这一批消息被丢弃（不提交、不重试），消费者继续运行
//! - offset提交失败只打印日志，不回滚（下次重启会重复消费，至少一次语义）
//!
//! 分区被收回时缓冲区中属于该分区的消息不会被清理，仍然可能被处理并提交，
//! 此时新的分区持有者也可能处理同一批消息，回调需要保证幂等。

use crate::broker::{BrokerClient, BrokerEvent, Msg, PartitionOffset};
use crate::traits::BatchHandler;
use color_eyre::Result;
use shared_lib::models::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_COMMIT_FLUSH_INTERVAL_MILLIS, DEFAULT_IDLE_POLL_SLEEP_MILLIS,
    DEFAULT_MSG_CHANNEL_CAPACITY, DEFAULT_POLL_TIMEOUT_MILLIS,
};
use shared_lib::KafkaConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio::try_join;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// 攒够多少条消息立即提交
    pub batch_size: usize,

    /// 最长多久强制提交一次
    pub commit_flush_interval: Duration,

    /// 拉取协程与提交协程之间的通道容量，通道满时拉取协程会阻塞
    pub channel_capacity: usize,

    /// 单次拉取的超时时间
    pub poll_timeout: Duration,

    /// 没有拉取到消息时的休眠时间
    pub idle_sleep: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            commit_flush_interval: Duration::from_millis(DEFAULT_COMMIT_FLUSH_INTERVAL_MILLIS),
            channel_capacity: DEFAULT_MSG_CHANNEL_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MILLIS),
            idle_sleep: Duration::from_millis(DEFAULT_IDLE_POLL_SLEEP_MILLIS),
        }
    }
}

impl From<&KafkaConfig> for ConsumerOptions {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            commit_flush_interval: config.commit_flush_interval,
            ..Self::default()
        }
    }
}

/// 运行时统计，只用于排查问题
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub messages_received: AtomicU64,
    pub batches_committed: AtomicU64,
    pub callback_failures: AtomicU64,
    pub commit_failures: AtomicU64,
}

pub struct BatchCommitConsumer<B: BrokerClient> {
    client: Arc<B>,
    topic: String,
    group_id: String,
    options: ConsumerOptions,
    stats: Arc<ConsumerStats>,
    assigned: Arc<Mutex<BTreeSet<i32>>>,
}

impl<B: BrokerClient> Clone for BatchCommitConsumer<B> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            topic: self.topic.clone(),
            group_id: self.group_id.clone(),
            options: self.options.clone(),
            stats: Arc::clone(&self.stats),
            assigned: Arc::clone(&self.assigned),
        }
    }
}

impl<B: BrokerClient + 'static> BatchCommitConsumer<B> {
    pub fn new(client: B, topic: impl Into<String>, group_id: impl Into<String>, options: ConsumerOptions) -> Self {
        let mut options = options;
        options.batch_size = options.batch_size.max(1);
        options.channel_capacity = options.channel_capacity.max(1);

        Self {
            client: Arc::new(client),
            topic: topic.into(),
            group_id: group_id.into(),
            options,
            stats: Arc::new(ConsumerStats::default()),
            assigned: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// 当前持有的分区，按分区号排序
    pub fn assigned_partitions(&self) -> Vec<i32> {
        self.lock_assigned().iter().copied().collect()
    }

    /// 在后台协程中运行消费者，`shutdown_rx` 变为 `true` 后会把缓冲区中的消息提交完再退出
    pub fn start<H: BatchHandler + 'static>(&self, handler: Arc<H>, shutdown_rx: Receiver<bool>) -> JoinHandle<Result<()>> {
        let consumer = self.clone();
        tokio::spawn(async move { consumer.run(handler, shutdown_rx).await })
    }

    #[instrument(skip_all, fields(topic = %self.topic, group_id = %self.group_id))]
    pub async fn run<H: BatchHandler>(&self, handler: Arc<H>, shutdown_rx: Receiver<bool>) -> Result<()> {
        info!(
            "BatchKafkaConsumer started: Topic={}, GroupId={}, BatchSize={}, FlushInterval={:?}",
            self.topic, self.group_id, self.options.batch_size, self.options.commit_flush_interval
        );

        let (msg_tx, msg_rx) = mpsc::channel(self.options.channel_capacity);

        try_join!(
            self.poll_loop(msg_tx, shutdown_rx.clone()),
            self.flush_loop(msg_rx, handler, shutdown_rx),
        )?;

        info!("BatchKafkaConsumer stopped: Topic={}, GroupId={}", self.topic, self.group_id);

        Ok(())
    }

    async fn poll_loop(&self, msg_tx: mpsc::Sender<Msg>, mut shutdown_rx: Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let event = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                event = self.client.poll(self.options.poll_timeout) => event,
            };

            match event {
                Some(BrokerEvent::Message(msg)) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

                    // 通道满时在这里阻塞，形成对拉取的背压
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        sent = msg_tx.send(msg) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(BrokerEvent::Error(err)) => {
                    error!(
                        "BatchKafkaConsumer Error: Topic={}, GroupId={}, Error={}",
                        self.topic, self.group_id, err
                    );
                }
                Some(BrokerEvent::Assigned(partitions)) => {
                    info!(
                        "BatchKafkaConsumer Assigned: Topic={}, GroupId={}, Partitions={:?}",
                        self.topic, self.group_id, partitions
                    );
                    self.lock_assigned().extend(partitions);
                }
                Some(BrokerEvent::Revoked(partitions)) => {
                    info!(
                        "BatchKafkaConsumer Revoked: Topic={}, GroupId={}, Partitions={:?}",
                        self.topic, self.group_id, partitions
                    );
                    let mut assigned = self.lock_assigned();
                    for partition in partitions {
                        assigned.remove(&partition);
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.options.idle_sleep) => {}
                    }
                }
            }
        }

        debug!("BatchKafkaConsumer poll loop exited: Topic={}", self.topic);

        Ok(())
    }

    async fn flush_loop<H: BatchHandler>(
        &self,
        mut msg_rx: mpsc::Receiver<Msg>,
        handler: Arc<H>,
        mut shutdown_rx: Receiver<bool>,
    ) -> Result<()> {
        let flush_interval = self.options.commit_flush_interval;
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buffer: Vec<Msg> = Vec::with_capacity(self.options.batch_size);
        let mut committed: HashMap<i32, i64> = HashMap::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };

                    buffer.push(msg);
                    if buffer.len() >= self.options.batch_size {
                        self.commit_batch(&buffer, handler.as_ref(), &mut committed).await;
                        buffer.clear();
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.commit_batch(&buffer, handler.as_ref(), &mut committed).await;
                        buffer.clear();
                    }
                }
            }
        }

        // 退出前把已经收到的消息处理完
        msg_rx.close();
        while let Some(msg) = msg_rx.recv().await {
            buffer.push(msg);
        }

        for chunk in buffer.chunks(self.options.batch_size) {
            self.commit_batch(chunk, handler.as_ref(), &mut committed).await;
        }

        debug!("BatchKafkaConsumer flush loop exited: Topic={}", self.topic);

        Ok(())
    }

    /// 执行一次回调并提交offset，不管结果如何调用方都会清空缓冲区
    async fn commit_batch<H: BatchHandler + ?Sized>(
        &self,
        batch: &[Msg],
        handler: &H,
        committed: &mut HashMap<i32, i64>,
    ) {
        let offsets = next_offsets(batch);

        if let Err(err) = handler.handle_batch(&self.topic, &self.group_id, batch).await {
            self.stats.callback_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                "BatchKafkaConsumer Callback Failed: Topic={}, GroupId={}, BatchSize={}, Error={:?}",
                self.topic,
                self.group_id,
                batch.len(),
                err
            );
            return;
        }

        // offset只前进不后退：重平衡后重复投递的旧消息不会把已提交的位置拉回去
        let to_commit: Vec<PartitionOffset> = offsets
            .into_iter()
            .filter(|(partition, offset)| committed.get(partition).map_or(true, |current| offset > current))
            .map(|(partition, offset)| PartitionOffset {
                topic: self.topic.clone(),
                partition,
                offset,
            })
            .collect();

        if to_commit.is_empty() {
            warn!(
                "BatchKafkaConsumer skip commit, offsets already committed: Topic={}, GroupId={}, BatchSize={}",
                self.topic,
                self.group_id,
                batch.len()
            );
            return;
        }

        match self.client.commit(&to_commit).await {
            Ok(()) => {
                for it in &to_commit {
                    committed.insert(it.partition, it.offset);
                }
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "BatchKafkaConsumer Committed: Topic={}, GroupId={}, BatchSize={}, Offsets={:?}",
                    self.topic,
                    self.group_id,
                    batch.len(),
                    to_commit.iter().map(|it| (it.partition, it.offset)).collect::<Vec<_>>()
                );
            }
            Err(err) => {
                self.stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "BatchKafkaConsumer CommitOffsets Failed: Topic={}, GroupId={}, Error={}",
                    self.topic, self.group_id, err
                );
            }
        }
    }

    fn lock_assigned(&self) -> std::sync::MutexGuard<'_, BTreeSet<i32>> {
        self.assigned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 每个分区需要提交的offset：该分区收到的最大offset + 1
fn next_offsets(batch: &[Msg]) -> BTreeMap<i32, i64> {
    let mut offsets = BTreeMap::new();
    for msg in batch {
        let next = msg.offset + 1;
        offsets
            .entry(msg.partition)
            .and_modify(|offset: &mut i64| *offset = (*offset).max(next))
            .or_insert(next);
    }
    offsets
}
