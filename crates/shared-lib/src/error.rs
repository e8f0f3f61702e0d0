//! 📋 错误处理模块
//!
//! 定义了协调层使用的统一错误类型。
//!
//! 注意：下面这些情况**不是**错误，而是正常的返回值：
//! - 有界队列已满：`push` 返回 0
//! - 分布式锁被其他节点持有：`obtain` 返回 `None`

use thiserror::Error;

/// 协调层错误类型
#[derive(Error, Debug)]
pub enum CoordError {
    #[error("❌ Redis错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("❌ 消息队列错误: {0}")]
    Broker(String),

    #[error("❌ 无效参数: {0}")]
    InvalidInput(String),
}

/// 协调层的 Result 类型
pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    /// 创建消息队列错误
    pub fn broker<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }

    /// 创建无效输入错误
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}
