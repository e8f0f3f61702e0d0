//! 租约保护的定时任务
//!
//! 多个进程会注册同一批定时任务，每次触发时先获取以 `job_id` 为键的租约锁，
//! 获取不到说明其他节点已经在执行这一次触发，直接跳过。
//!
//! 任务结束后锁不会被删除，由TTL自然过期，所以同一个任务在一个TTL内最多执行一次。

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use shared_lib::models::constants::{JOB_LOCK_REFRESH_MILLIS, JOB_LOCK_TTL_MILLIS};
use shared_lib::{obtain_and_run, ScriptedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::Job;
use tracing::{debug, error};

/// 定时任务的执行体，参数为本次触发的唯一键
pub type JobTask = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// 本次触发的唯一键：`<job_id>#<UTC时间，精确到秒>`
pub fn tick_key(job_id: &str, now: DateTime<Utc>) -> String {
    format!("{}#{}", job_id, now.format("%Y-%m-%dT%H:%M:%S"))
}

/// 在租约锁保护下执行一次任务
///
/// 返回 `true` 表示本节点执行了任务（不论任务本身是否成功），`false` 表示被其他节点抢先
pub async fn run_leased_tick(store: &Arc<dyn ScriptedStore>, job_id: &str, task: &JobTask) -> Result<bool> {
    let key = tick_key(job_id, Utc::now());

    let outcome = obtain_and_run(
        store,
        job_id,
        Duration::from_millis(JOB_LOCK_TTL_MILLIS),
        Duration::from_millis(JOB_LOCK_REFRESH_MILLIS),
        task(key.clone()),
    )
    .await?;

    match outcome {
        None => {
            debug!("⏭️ 定时任务 {} 已由其他节点执行，跳过: TickKey={}", job_id, key);
            Ok(false)
        }
        Some(Ok(())) => {
            debug!("✅ 定时任务 {} 执行完成: TickKey={}", job_id, key);
            Ok(true)
        }
        Some(Err(err)) => {
            error!("❌ 定时任务 {} 执行失败: TickKey={}, Error={:?}", job_id, key, err);
            Ok(true)
        }
    }
}

/// 创建一个租约保护的cron任务，`cron_expr` 为6位cron表达式（精确到秒）
pub fn leased_job(cron_expr: &str, job_id: &str, store: Arc<dyn ScriptedStore>, task: JobTask) -> Result<Job> {
    let job_id = job_id.to_string();

    let job = Job::new_async(cron_expr, move |_uuid, _l| {
        let store = Arc::clone(&store);
        let task = Arc::clone(&task);
        let job_id = job_id.clone();

        Box::pin(async move {
            if let Err(err) = run_leased_tick(&store, &job_id, &task).await {
                error!("❌ 定时任务 {} 获取租约失败: {}", job_id, err);
            }
        })
    })?;

    Ok(job)
}
