use color_eyre::Result;
use shared_lib::{BoundedQueue, ScriptedStore};
use std::sync::Arc;
use tokio::sync::watch::Receiver;
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

pub mod jobs;
pub mod leased;

pub use leased::{leased_job, run_leased_tick, tick_key, JobTask};

/// 启动定时任务
///
/// 所有任务都通过租约锁保护，多个节点同时运行时每次触发只有一个节点执行
pub async fn start_cron_tasks(
    store: Arc<dyn ScriptedStore>,
    queue: Arc<BoundedQueue<u64>>,
    shutdown_rx: Receiver<bool>,
) -> Result<()> {
    info!("🕐 启动定时任务调度器...");

    // 创建 cron 调度器
    let mut sched = JobScheduler::new().await?;

    // 每5秒生成一批工作项
    sched
        .add(leased_job(
            "0/5 * * * * *",
            jobs::enqueue_work_items::JOB_ID,
            Arc::clone(&store),
            jobs::enqueue_work_items::task(Arc::clone(&queue)),
        )?)
        .await?;

    // 每30秒打印一次队列状态
    sched
        .add(leased_job(
            "0/30 * * * * *",
            jobs::queue_report::JOB_ID,
            Arc::clone(&store),
            jobs::queue_report::task(Arc::clone(&queue)),
        )?)
        .await?;

    // 启动调度器（非阻塞）
    sched.start().await?;
    info!("✅ 定时任务调度器已启动");

    // 等待关闭信号（这里才真正阻塞等待）
    wait_for_shutdown(shutdown_rx).await;

    info!("📴 收到关闭信号，停止定时任务调度器...");
    sched.shutdown().await?;
    info!("✅ 定时任务调度器已停止");

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown(mut shutdown_rx: Receiver<bool>) {
    // 如果已经是 true，直接返回
    if *shutdown_rx.borrow() {
        return;
    }

    // 等待信号变化，发送端被丢弃时同样视为关闭
    let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
}
