//! 支持原子脚本的键值存储客户端
//!
//! 有界队列和租约锁需要“读-判断-写”在一次往返中原子完成，
//! 这里把这些原子操作抽象成 [`ScriptedStore`] 特征：
//!
//! - [`RedisStore`]: 基于Redis Lua脚本实现，生产环境使用
//! - [`MemoryStore`]: 进程内实现，每个操作在同一把锁内完成，用于测试和本地调试
//!
//! 不允许把原子操作拆成客户端的“先读后写”两步，否则多进程并发时会出现超出容量、重复消费等竞态问题。

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::Result;
use crate::models::config::{RedisConfig, StoreMode};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// 有界队列原子写入的结果
///
/// 与存储交互时所有数值都使用十进制字符串，由上层负责解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPushReply {
    /// 本次写入的元素个数，队列已满时为0
    pub pushed: i64,

    /// 队列历史上写入过的最大值，从未写入过时为 `None`
    pub max_val: Option<String>,

    /// 队列当前的队尾元素（写入成功时为本次写入的最后一个元素）
    pub last_val: Option<String>,
}

/// 支持原子脚本的键值存储
///
/// 由于存储需要在多个协程之间共享（一般为 `Arc<dyn ScriptedStore>`），因此需要实现 [`Send`] 和 [`Sync`]
#[async_trait]
pub trait ScriptedStore: Send + Sync {
    /// 原子的有界写入：当前长度加上写入个数超过 `max_len` 时一个都不写入
    ///
    /// 写入成功时同时更新 `<key>:maxval` 最高水位，并把列表的TTL同步给最高水位键。
    /// `values` 为空时不写入，返回 `pushed = 0` 以及当前的最高水位和队尾元素
    async fn bounded_push(&self, key: &str, max_len: i64, values: &[String]) -> Result<RawPushReply>;

    /// 原子的批量取出：读取队头最多 `count` 个元素并在同一次操作中删除它们
    async fn drain_pop(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// 键不存在时写入 `token` 并设置过期时间，返回是否写入成功
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// 键的值仍然是 `token` 时重置过期时间，返回是否续期成功
    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// 键的值仍然是 `token` 时删除该键，返回是否删除成功
    async fn release_if_owner(&self, key: &str, token: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn list_len(&self, key: &str) -> Result<i64>;

    /// 剩余存活时间，键不存在或者没有过期时间时返回 `None`
    async fn pttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, keys: &[String]) -> Result<u64>;
}

/// 根据配置创建存储客户端
pub async fn connect_store(config: &RedisConfig) -> Result<Arc<dyn ScriptedStore>> {
    match config.mode {
        StoreMode::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_conn_str).await?)),
        StoreMode::Memory => {
            warn!("⚠️ 使用进程内存储，锁和队列无法在多个进程之间共享");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// 比较两个规范的十进制无符号整数字符串（没有前导0）
///
/// 直接比较字符串避免转换成浮点数时丢失 `u64` 的精度，Lua脚本中使用相同的规则
pub(crate) fn decimal_greater(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return a.len() > b.len();
    }

    a > b
}

#[cfg(test)]
mod tests {
    use super::decimal_greater;

    #[test]
    fn test_decimal_greater() {
        assert!(decimal_greater("10", "9"));
        assert!(decimal_greater("18446744073709551615", "18446744073709551614"));
        assert!(!decimal_greater("5", "5"));
        assert!(!decimal_greater("123", "1234"));
    }
}
