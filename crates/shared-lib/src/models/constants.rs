//! 协调层常量定义模块
//!
//! 统一管理有界队列、租约锁、批量消费者的默认参数，
//! 确保多个服务使用的默认值保持一致。

/// 有界队列最高水位辅助键的后缀
///
/// 与队列列表键放在一起，例如 `jobs:pending` 的最高水位键为 `jobs:pending:maxval`
pub const QUEUE_MAX_VAL_SUFFIX: &str = ":maxval";

/// 默认的有界队列键名
pub const DEFAULT_QUEUE_KEY: &str = "coord_backend:queue:pending";

/// 默认的有界队列容量
pub const DEFAULT_QUEUE_MAX_COUNT: i64 = 10_000;

/// 默认的队列消费协程个数
pub const DEFAULT_QUEUE_WORKERS: usize = 4;

/// 每个队列消费协程单次最多取出的元素个数
pub const DEFAULT_QUEUE_POP_BATCH: usize = 100;

/// 队列为空时消费协程的休眠时间（毫秒）
pub const QUEUE_IDLE_SLEEP_MILLIS: u64 = 1000;

/// 定时任务租约锁的租约时长（毫秒）
///
/// 定时任务结束后不主动释放锁，这个时长同时决定了同一任务两次执行的最小间隔
pub const JOB_LOCK_TTL_MILLIS: u64 = 1000;

/// 定时任务租约锁的续租间隔（毫秒），必须小于 [`JOB_LOCK_TTL_MILLIS`]
pub const JOB_LOCK_REFRESH_MILLIS: u64 = 330;

/// 批量消费者默认的批量大小
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// 批量消费者默认的强制提交间隔（毫秒）
pub const DEFAULT_COMMIT_FLUSH_INTERVAL_MILLIS: u64 = 50;

/// 拉取协程与提交协程之间的内部通道容量
pub const DEFAULT_MSG_CHANNEL_CAPACITY: usize = 5000;

/// 单次拉取消息的超时时间（毫秒）
pub const DEFAULT_POLL_TIMEOUT_MILLIS: u64 = 100;

/// 没有拉取到消息时的休眠时间（毫秒）
pub const DEFAULT_IDLE_POLL_SLEEP_MILLIS: u64 = 1000;
