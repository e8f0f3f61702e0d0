//! 基于Redis的有界队列
//!
//! 多个进程可以同时对同一个 `key` 写入和读取：
//!
//! - 写入（[`BoundedQueue::push`]）由一个Lua脚本原子完成：读取当前长度，如果写入后会超过容量则**一个都不写**
//! - 读取（[`BoundedQueue::pop`]）同样由一个Lua脚本原子完成：读取队头元素并立即删除
//!
//! 这样并发写入时不会超过容量，并发读取时同一个元素也不会被重复取出，不需要额外的分布式锁。
//!
//! ## 队列满时的处理
//!
//! 队列满不是错误，`push` 直接返回 `0` 并打印一条警告日志，**不会阻塞等待**。
//! 需要阻塞写入的调用方自行决定重试间隔或者丢弃数据。

use crate::error::{CoordError, Result};
use crate::models::constants::QUEUE_MAX_VAL_SUFFIX;
use crate::store::ScriptedStore;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

mod sealed {
    pub trait Sealed {}
}

/// 有界队列支持的元素类型
///
/// 目前只支持无符号整数，在存储中以十进制字符串保存。
/// 需要保存任意数据时应该使用另外一种队列，而不是扩展这个特征。
pub trait QueueValue: sealed::Sealed + Copy + Debug + Send + Sync + 'static {
    fn encode(self) -> String;

    fn decode(raw: &str) -> Option<Self>;
}

macro_rules! impl_queue_value {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl QueueValue for $ty {
                fn encode(self) -> String {
                    self.to_string()
                }

                fn decode(raw: &str) -> Option<Self> {
                    raw.parse().ok()
                }
            }
        )*
    };
}

impl_queue_value!(u8, u16, u32, u64, usize);

/// 写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReply<T> {
    /// 本次写入的元素个数，队列已满时为0
    pub pushed: i64,

    /// 队列历史上写入过的最大值
    pub max_val: Option<T>,

    /// 队尾元素，一般用于排查问题
    pub last_val: Option<T>,
}

/// 有界队列
///
/// 使用方需要显式创建并传递给使用者，同一个 `key` 可以在多个进程中分别创建
pub struct BoundedQueue<T: QueueValue> {
    store: Arc<dyn ScriptedStore>,
    key: String,
    max_count: i64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: QueueValue> BoundedQueue<T> {
    pub fn new(store: Arc<dyn ScriptedStore>, key: impl Into<String>, max_count: i64) -> Result<Self> {
        let key = key.into();

        if max_count <= 0 {
            return Err(CoordError::invalid_input(format!(
                "queue {key} max_count must be positive, got {max_count}"
            )));
        }

        Ok(Self {
            store,
            key,
            max_count,
            _marker: PhantomData,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_count(&self) -> i64 {
        self.max_count
    }

    /// 写入一批元素，返回写入的个数
    ///
    /// 要么全部写入，要么一个都不写入（队列剩余空间不足时返回0）
    pub async fn push(&self, values: &[T]) -> Result<i64> {
        Ok(self.push_detailed(values).await?.pushed)
    }

    /// 与 [`BoundedQueue::push`] 相同，同时返回最高水位和队尾元素
    pub async fn push_detailed(&self, values: &[T]) -> Result<PushReply<T>> {
        if values.is_empty() {
            return Ok(PushReply {
                pushed: 0,
                max_val: None,
                last_val: None,
            });
        }

        let raw: Vec<String> = values.iter().map(|v| v.encode()).collect();

        let reply = self
            .store
            .bounded_push(&self.key, self.max_count, &raw)
            .await
            .inspect_err(|err| error!("Push Failed: Key={}, Error={}", self.key, err))?;

        let reply = PushReply {
            pushed: reply.pushed,
            max_val: reply.max_val.and_then(|raw| self.decode_logged(&raw)),
            last_val: reply.last_val.and_then(|raw| self.decode_logged(&raw)),
        };

        if reply.pushed == 0 {
            warn!(
                "Redis有界队列已满: Key={}, PushSize={}, MaxCount={}, MaxVal={:?}, LastVal={:?}",
                self.key,
                values.len(),
                self.max_count,
                reply.max_val,
                reply.last_val
            );
        } else {
            debug!(
                "Redis有界队列写入: Key={}, PushSize={}, MaxCount={}, MaxVal={:?}, LastVal={:?}",
                self.key, reply.pushed, self.max_count, reply.max_val, reply.last_val
            );
        }

        Ok(reply)
    }

    /// 从队头取出最多 `count` 个元素，队列为空时返回空数组，不会阻塞
    ///
    /// 无法解析的元素会被丢弃并打印警告（元素已经从队列中删除）
    pub async fn pop(&self, count: usize) -> Result<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let raw = self
            .store
            .drain_pop(&self.key, count)
            .await
            .inspect_err(|err| error!("Pop Failed: Key={}, Error={}", self.key, err))?;

        Ok(raw.iter().filter_map(|value| self.decode_logged(value)).collect())
    }

    /// 当前队列长度
    pub async fn len(&self) -> Result<i64> {
        self.store.list_len(&self.key).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// 队列历史上写入过的最大值
    pub async fn max_val(&self) -> Result<Option<T>> {
        Ok(self
            .store
            .get(&self.max_val_key())
            .await?
            .and_then(|raw| self.decode_logged(&raw)))
    }

    /// 给队列设置过期时间，之后的写入会把过期时间同步给最高水位
    pub async fn expire(&self, ttl: Duration) -> Result<bool> {
        self.store.expire(&self.key, ttl).await
    }

    /// 删除队列以及最高水位
    pub async fn clear(&self) -> Result<()> {
        self.store.del(&[self.key.clone(), self.max_val_key()]).await?;
        Ok(())
    }

    fn max_val_key(&self) -> String {
        format!("{}{}", self.key, QUEUE_MAX_VAL_SUFFIX)
    }

    fn decode_logged(&self, raw: &str) -> Option<T> {
        let value = T::decode(raw);
        if value.is_none() {
            warn!("Redis有界队列中存在无法解析的元素: Key={}, Value={}", self.key, raw);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn new_queue<T: QueueValue>(max_count: i64) -> BoundedQueue<T> {
        BoundedQueue::new(Arc::new(MemoryStore::new()), "test:queue", max_count).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = new_queue::<u32>(10);

        assert_eq!(queue.push(&[1, 2, 3]).await.unwrap(), 3);
        assert_eq!(queue.pop(2).await.unwrap(), vec![1, 2]);
        assert_eq!(queue.pop(10).await.unwrap(), vec![3]);
        assert!(queue.pop(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_is_all_or_nothing() {
        let queue = new_queue::<u64>(4);

        assert_eq!(queue.push(&[1, 2, 3]).await.unwrap(), 3);

        let reply = queue.push_detailed(&[4, 5]).await.unwrap();
        assert_eq!(reply.pushed, 0);
        assert_eq!(reply.max_val, Some(3));
        assert_eq!(reply.last_val, Some(3));

        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(queue.pop(10).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_max_val_is_high_water_mark() {
        let queue = new_queue::<u16>(10);

        let reply = queue.push_detailed(&[5, 3, 9, 1]).await.unwrap();
        assert_eq!(reply.pushed, 4);
        assert_eq!(reply.max_val, Some(9));
        assert_eq!(reply.last_val, Some(1));

        queue.pop(4).await.unwrap();
        queue.push(&[2]).await.unwrap();

        assert_eq!(queue.max_val().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_empty_push_and_zero_pop_are_noops() {
        let queue = new_queue::<u8>(1);

        assert_eq!(queue.push(&[]).await.unwrap(), 0);
        queue.push(&[7]).await.unwrap();

        assert!(queue.pop(0).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_u64_values_keep_precision() {
        let queue = new_queue::<u64>(3);

        queue.push(&[u64::MAX - 1, u64::MAX, 1]).await.unwrap();

        assert_eq!(queue.max_val().await.unwrap(), Some(u64::MAX));
        assert_eq!(queue.pop(3).await.unwrap(), vec![u64::MAX - 1, u64::MAX, 1]);
    }

    #[tokio::test]
    async fn test_invalid_capacity() {
        let store: Arc<dyn ScriptedStore> = Arc::new(MemoryStore::new());
        assert!(BoundedQueue::<u32>::new(Arc::clone(&store), "q", 0).is_err());
        assert!(BoundedQueue::<u32>::new(store, "q", -1).is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_max_val() {
        let queue = new_queue::<u32>(10);
        queue.push(&[4]).await.unwrap();

        queue.clear().await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.max_val().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_push_never_exceeds_capacity() {
        let store: Arc<dyn ScriptedStore> = Arc::new(MemoryStore::new());

        let producers: Vec<_> = (0..20u64)
            .map(|i| {
                let queue = BoundedQueue::<u64>::new(Arc::clone(&store), "test:queue", 10).unwrap();
                tokio::spawn(async move { queue.push(&[i * 3, i * 3 + 1, i * 3 + 2]).await.unwrap() })
            })
            .collect();

        let mut pushed = 0;
        for producer in producers {
            pushed += producer.await.unwrap();
        }

        let queue = BoundedQueue::<u64>::new(store, "test:queue", 10).unwrap();
        assert_eq!(pushed, 9);
        assert_eq!(queue.len().await.unwrap(), 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pop_never_delivers_twice() {
        let store: Arc<dyn ScriptedStore> = Arc::new(MemoryStore::new());
        let queue = BoundedQueue::<u32>::new(Arc::clone(&store), "test:queue", 1000).unwrap();
        let values: Vec<u32> = (0..1000).collect();
        queue.push(&values).await.unwrap();

        let consumers: Vec<_> = (0..8)
            .map(|_| {
                let queue = BoundedQueue::<u32>::new(Arc::clone(&store), "test:queue", 1000).unwrap();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    loop {
                        let batch = queue.pop(7).await.unwrap();
                        if batch.is_empty() {
                            break seen;
                        }
                        seen.extend(batch);
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }

        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }
}
