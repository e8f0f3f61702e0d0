use crate::models::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_COMMIT_FLUSH_INTERVAL_MILLIS, DEFAULT_QUEUE_KEY, DEFAULT_QUEUE_MAX_COUNT,
    DEFAULT_QUEUE_POP_BATCH, DEFAULT_QUEUE_WORKERS,
};
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Help, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// 使用Redis（生产环境）
    Redis,

    /// 使用进程内存储，仅适合本地调试和单进程运行
    Memory,
}

impl FromStr for StoreMode {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreMode::Redis),
            "memory" => Ok(StoreMode::Memory),
            other => Err(eyre!("unknown store mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// redis链接字符串
    ///
    /// 可通过环境变量 `REDIS_URL` 来调整，`STORE_MODE=redis` 时必须设置
    pub redis_conn_str: String,

    /// 存储后端类型，可通过环境变量 `STORE_MODE` 来调整（`redis` / `memory`）
    pub mode: StoreMode,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// 有界队列在redis中的键名，环境变量 `QUEUE_KEY`
    pub key: String,

    /// 有界队列的最大长度，环境变量 `QUEUE_MAX_COUNT`
    pub max_count: i64,

    /// 同时消费队列的协程个数，环境变量 `QUEUE_WORKERS`
    pub workers: usize,

    /// 每个协程单次最多取出的元素个数，环境变量 `QUEUE_POP_BATCH`
    pub pop_batch: usize,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// kafka broker地址，环境变量 `KAFKA_BROKERS`
    pub brokers: String,

    /// 消费者组，环境变量 `KAFKA_GROUP_ID`
    pub group_id: String,

    /// 订阅的topic，环境变量 `KAFKA_TOPIC`
    pub topic: String,

    /// 没有已提交offset时从哪里开始消费（`earliest` / `latest`），环境变量 `KAFKA_OFFSET_RESET`
    pub offset_reset: String,

    /// 攒够多少条消息触发一次提交，环境变量 `KAFKA_BATCH_SIZE`
    pub batch_size: usize,

    /// 最长多久强制提交一次，环境变量 `KAFKA_FLUSH_INTERVAL_MS`
    pub commit_flush_interval: Duration,
}

/// 程序配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// redis配置
    pub redis: RedisConfig,

    /// 有界队列配置
    pub queue: QueueConfig,

    /// kafka批量消费者配置
    pub kafka: KafkaConfig,
}

impl AppConfig {
    pub fn load() -> Result<Arc<AppConfig>> {
        // 加载.env文件中的数据注入到环境变量中，方便本地测试
        // 线上环境部署时会直接使用环境变量，不需要.env文件
        let _ = dotenvy::dotenv();

        let mode: StoreMode = env_or("STORE_MODE", StoreMode::Redis);

        let redis_url = match mode {
            StoreMode::Redis => std::env::var("REDIS_URL")
                .context("Can not load REDIS_URL in environment")
                .suggestion("设置 REDIS_URL 环境变量，或者设置 STORE_MODE=memory 使用进程内存储")?,
            StoreMode::Memory => std::env::var("REDIS_URL").unwrap_or_default(),
        };

        let config = AppConfig {
            redis: RedisConfig {
                redis_conn_str: redis_url,
                mode,
            },
            queue: QueueConfig {
                key: std::env::var("QUEUE_KEY").unwrap_or_else(|_| DEFAULT_QUEUE_KEY.to_string()),
                max_count: env_or("QUEUE_MAX_COUNT", DEFAULT_QUEUE_MAX_COUNT),
                workers: env_or("QUEUE_WORKERS", DEFAULT_QUEUE_WORKERS),
                pop_batch: env_or("QUEUE_POP_BATCH", DEFAULT_QUEUE_POP_BATCH),
            },
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
                group_id: std::env::var("KAFKA_GROUP_ID").unwrap_or_else(|_| "coord-backend".to_string()),
                topic: std::env::var("KAFKA_TOPIC").unwrap_or_else(|_| "coord_backend_events".to_string()),
                offset_reset: std::env::var("KAFKA_OFFSET_RESET").unwrap_or_else(|_| "latest".to_string()),
                batch_size: env_or("KAFKA_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                commit_flush_interval: Duration::from_millis(env_or(
                    "KAFKA_FLUSH_INTERVAL_MS",
                    DEFAULT_COMMIT_FLUSH_INTERVAL_MILLIS,
                )),
            },
        };

        config.validate()?;

        Ok(Arc::new(config))
    }

    fn validate(&self) -> Result<()> {
        if self.queue.max_count <= 0 {
            return Err::<(), _>(eyre!("QUEUE_MAX_COUNT must be positive, got {}", self.queue.max_count))
                .suggestion("设置一个大于0的 QUEUE_MAX_COUNT");
        }

        if self.kafka.batch_size == 0 {
            return Err::<(), _>(eyre!("KAFKA_BATCH_SIZE must be positive")).suggestion("设置一个大于0的 KAFKA_BATCH_SIZE");
        }

        Ok(())
    }
}

/// 读取环境变量，变量不存在或者格式不正确时使用默认值
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("环境变量 {} 格式不正确: {}，使用默认值", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_mode_parse() {
        assert_eq!("redis".parse::<StoreMode>().unwrap(), StoreMode::Redis);
        assert_eq!("MEMORY".parse::<StoreMode>().unwrap(), StoreMode::Memory);
        assert!("etcd".parse::<StoreMode>().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("COORD_TEST_ENV_OR_GARBAGE", "not-a-number");
        assert_eq!(env_or("COORD_TEST_ENV_OR_GARBAGE", 7usize), 7);

        std::env::set_var("COORD_TEST_ENV_OR_VALID", "42");
        assert_eq!(env_or("COORD_TEST_ENV_OR_VALID", 7usize), 42);

        assert_eq!(env_or("COORD_TEST_ENV_OR_MISSING", 3i64), 3);
    }
}
