//! 🔧 共享库模块
//!
//! 这个模块包含了在多个服务之间共享的分布式协调工具，包括：
//! - 支持原子脚本的存储客户端（Redis / 进程内）
//! - 基于原子脚本的有界队列
//! - 带自动续租的分布式租约锁
//! - 程序配置和常量

pub mod distributed_lock;
pub mod error;
pub mod models;
pub mod queue;
pub mod store;

// 重新导出常用类型
pub use error::{CoordError, Result};
pub use models::{AppConfig, KafkaConfig, QueueConfig, RedisConfig, StoreMode};
pub use queue::{BoundedQueue, PushReply, QueueValue};
pub use store::{connect_store, MemoryStore, RedisStore, ScriptedStore};

// 重新导出分布式锁功能
pub use distributed_lock::{execute_with_lease, obtain_and_run, DistributedLock, LeaseLock, LeaseSignal};
