//! 定时任务实现
//!
//! 每个任务提供一个 `execute_once`（方便测试）以及一个包装成 [`crate::leased::JobTask`] 的 `task`。

pub mod enqueue_work_items;
pub mod queue_report;
