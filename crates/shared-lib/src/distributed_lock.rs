//! 分布式租约锁工具模块
//!
//! 提供基于Redis的租约锁功能，支持：
//! - 带租约时长（TTL）的互斥锁，持有者崩溃后锁会自动过期
//! - 后台协程定时续租，业务执行多久就持有多久
//! - 获取不到锁时直接跳过，不排队也不等待
//!
//! ## TTL 与续租间隔
//!
//! TTL 不是“任务预计执行时间”，而是“持有者失联多久之后允许别人接管”：
//!
//! | 场景        | ttl | refresh_interval |
//! | ---------- | --- | ---------------- |
//! | 普通定时任务 | 10s | 3s               |
//! | IO/网络任务  | 30s | 10s              |
//! | 重计算任务   | 60s | 15-20s           |
//!
//! 续租间隔必须小于TTL，否则锁会在两次续租之间过期。
//!
//! ## 不主动释放
//!
//! [`execute_with_lease`] 在业务结束后只停止续租，不删除锁，剩余的TTL用来限制同一任务的执行频率
//! （例如 `ttl = 1s` 时，一秒内其他节点不可能再次获得这把锁）。

use crate::error::{CoordError, Result};
use crate::store::ScriptedStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

/// 分布式锁管理器
pub struct DistributedLock {
    store: Arc<dyn ScriptedStore>,
    lock_key: String,
    lock_ttl: Duration,
}

impl DistributedLock {
    /// 创建新的分布式锁管理器
    pub fn new(store: Arc<dyn ScriptedStore>, lock_key: impl Into<String>, lock_ttl: Duration) -> Self {
        Self {
            store,
            lock_key: lock_key.into(),
            lock_ttl,
        }
    }

    /// 尝试获取锁
    ///
    /// 返回 [`LeaseLock`] 如果成功获取锁，锁被其他节点持有时返回 `None`（这不是错误）
    pub async fn try_acquire(&self) -> Result<Option<LeaseLock>> {
        let token = format!("{:032x}", rand::random::<u128>());

        let acquired = self
            .store
            .set_if_absent(&self.lock_key, &token, self.lock_ttl)
            .await
            .inspect_err(|err| error!("Failed to obtain lock: Key={}, Error={}", self.lock_key, err))?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(LeaseLock {
            store: Arc::clone(&self.store),
            key: self.lock_key.clone(),
            ttl: self.lock_ttl,
            token,
        }))
    }
}

/// 已经获取到的租约
///
/// 只有锁的值仍然是自己的 `token` 时才能续租和释放，避免误操作其他节点重新获取的锁
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn ScriptedStore>,
    key: String,
    ttl: Duration,
    token: String,
}

impl LeaseLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 续租一个完整的TTL，锁已经过期或者被别人持有时返回 `false`
    pub async fn refresh(&self) -> Result<bool> {
        self.store.extend_if_owner(&self.key, &self.token, self.ttl).await
    }

    /// 主动释放锁
    pub async fn release(self) -> Result<bool> {
        self.store.release_if_owner(&self.key, &self.token).await
    }

    /// 锁的剩余时间，锁已经不存在时返回 `None`
    pub async fn remaining_ttl(&self) -> Result<Option<Duration>> {
        self.store.pttl(&self.key).await
    }
}

/// 租约状态信号
///
/// 续租失败时信号会变为“已丢失”，此时其他节点可能已经拿到锁并开始执行同样的任务。
/// 不能容忍重复执行的业务可以在合适的位置检查 [`LeaseSignal::is_lost`] 并主动退出。
///
/// - 锁已经被别人持有：信号保持“已丢失”，续租协程退出
/// - 网络错误：信号变为“已丢失”，之后某次续租成功会恢复为未丢失
#[derive(Clone)]
pub struct LeaseSignal {
    lost_rx: watch::Receiver<bool>,
}

impl LeaseSignal {
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// 等待租约丢失；业务正常结束（续租协程退出）前租约一直有效时永远不会返回
    pub async fn lost(&mut self) {
        let renewal_stopped = self.lost_rx.wait_for(|lost| *lost).await.is_err();
        if renewal_stopped {
            std::future::pending::<()>().await;
        }
    }
}

/// 续租协程的守卫，drop时通知续租协程退出（包括业务panic的情况）
struct RenewalGuard {
    stop_tx: watch::Sender<bool>,
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

fn spawn_renewal(lease: LeaseLock, refresh_interval: Duration) -> (RenewalGuard, LeaseSignal) {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let (lost_tx, lost_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + refresh_interval, refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    match lease.refresh().await {
                        Ok(true) => {
                            trace!("Lock refreshed: Key={}", lease.key);
                            // 之前的网络错误没有导致锁丢失
                            lost_tx.send_if_modified(|lost| std::mem::replace(lost, false));
                        }
                        Ok(false) => {
                            error!("Failed to refresh lock: Key={}, Error=lease is no longer held", lease.key);
                            let _ = lost_tx.send(true);
                            break;
                        }
                        Err(err) => {
                            error!("Failed to refresh lock: Key={}, Error={}", lease.key, err);
                            let _ = lost_tx.send(true);
                        }
                    }
                }
            }
        }

        trace!("Lock renewal stopped: Key={}", lease.key);
    });

    (RenewalGuard { stop_tx }, LeaseSignal { lost_rx })
}

/// 租约锁：获取锁之后执行 `operation`，执行期间后台自动续租
///
/// # 参数
/// - `store`: 存储客户端
/// - `lock_key`: 锁的键名
/// - `lock_ttl`: 单次租约时长
/// - `refresh_interval`: 续租间隔，必须小于 `lock_ttl`
/// - `operation`: 需要在锁保护下执行的操作，参数为租约状态信号
///
/// # 返回值
/// 返回操作的结果，如果获取锁失败（其他节点正在执行）则返回 `None`，`operation` 不会被执行。
///
/// 续租失败只会打印错误日志并通知 [`LeaseSignal`]，不会中断 `operation`。
/// `operation` 结束后停止续租，但是**不会删除锁**，由TTL自然过期。
pub async fn execute_with_lease<T, F, Fut>(
    store: &Arc<dyn ScriptedStore>,
    lock_key: &str,
    lock_ttl: Duration,
    refresh_interval: Duration,
    operation: F,
) -> Result<Option<T>>
where
    F: FnOnce(LeaseSignal) -> Fut,
    Fut: Future<Output = T>,
{
    if refresh_interval.is_zero() || refresh_interval >= lock_ttl {
        return Err(CoordError::invalid_input(format!(
            "lock {lock_key}: refresh interval {refresh_interval:?} must be positive and shorter than ttl {lock_ttl:?}"
        )));
    }

    let lock_manager = DistributedLock::new(Arc::clone(store), lock_key, lock_ttl);

    let Some(lease) = lock_manager.try_acquire().await? else {
        // 获取不到锁，直接返回
        debug!("🔒 Lock is held by another node, skip: Key={}", lock_key);
        return Ok(None);
    };

    debug!("🔓 Lock obtained: Key={}, TTL={:?}", lock_key, lock_ttl);

    let (_guard, signal) = spawn_renewal(lease, refresh_interval);

    // 拿到锁执行业务逻辑，_guard离开作用域时停止续租，不调用release
    Ok(Some(operation(signal).await))
}

/// 便捷函数：不关心租约状态信号时使用
pub async fn obtain_and_run<T, Fut>(
    store: &Arc<dyn ScriptedStore>,
    lock_key: &str,
    lock_ttl: Duration,
    refresh_interval: Duration,
    operation: Fut,
) -> Result<Option<T>>
where
    Fut: Future<Output = T>,
{
    execute_with_lease(store, lock_key, lock_ttl, refresh_interval, |_| operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn new_store() -> Arc<dyn ScriptedStore> {
        Arc::new(MemoryStore::new())
    }

    async fn can_acquire(store: &Arc<dyn ScriptedStore>, key: &str) -> bool {
        DistributedLock::new(Arc::clone(store), key, Duration::from_secs(1))
            .try_acquire()
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion_until_ttl_lapses() {
        let store = new_store();
        let lock = DistributedLock::new(Arc::clone(&store), "job:a", Duration::from_secs(2));

        assert!(lock.try_acquire().await.unwrap().is_some());
        assert!(lock.try_acquire().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(2001)).await;

        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_allows_next_holder() {
        let store = new_store();
        let lock = DistributedLock::new(Arc::clone(&store), "job:a", Duration::from_secs(30));

        let lease = lock.try_acquire().await.unwrap().unwrap();
        assert!(lease.release().await.unwrap());

        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_runner_is_skipped() {
        let store = new_store();
        let second_ran = Arc::new(AtomicBool::new(false));

        let first = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                obtain_and_run(&store, "job:b", Duration::from_secs(2), Duration::from_millis(500), async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "first"
                })
                .await
                .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;

        let flag = Arc::clone(&second_ran);
        let second = obtain_and_run(&store, "job:b", Duration::from_secs(2), Duration::from_millis(500), async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert!(second.is_none());
        assert!(!second_ran.load(Ordering::SeqCst));
        assert_eq!(first.await.unwrap(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lock_during_long_body() {
        let store = new_store();

        let runner = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                obtain_and_run(&store, "job:c", Duration::from_secs(2), Duration::from_millis(500), async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                })
                .await
                .unwrap()
            })
        };

        // 错开续租的时间点，每隔500ms检查一次，覆盖整个5秒
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..9 {
            assert!(!can_acquire(&store, "job:c").await);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        assert_eq!(runner.await.unwrap(), Some(()));

        // 业务结束后不主动释放锁，剩余TTL内依然无法获取
        assert!(!can_acquire(&store, "job:c").await);
        assert!(store.pttl("job:c").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(can_acquire(&store, "job:c").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_is_signalled_but_body_completes() {
        let store = new_store();

        let runner = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                execute_with_lease(
                    &store,
                    "job:d",
                    Duration::from_secs(2),
                    Duration::from_millis(500),
                    |mut signal| async move {
                        signal.lost().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        signal.is_lost()
                    },
                )
                .await
                .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;

        // 模拟锁过期后被其他节点抢走
        store.del(&["job:d".to_string()]).await.unwrap();
        assert!(can_acquire(&store, "job:d").await);

        assert_eq!(runner.await.unwrap(), Some(true));
    }

    /// 前 `failures` 次续租返回网络错误，其余操作直接转发给 [`MemoryStore`]
    struct FlakyRefreshStore {
        inner: MemoryStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ScriptedStore for FlakyRefreshStore {
        async fn bounded_push(&self, key: &str, max_len: i64, values: &[String]) -> Result<crate::store::RawPushReply> {
            self.inner.bounded_push(key, max_len, values).await
        }

        async fn drain_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
            self.inner.drain_pop(key, count).await
        }

        async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, token, ttl).await
        }

        async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(CoordError::broker("connection reset by peer"));
            }
            self.inner.extend_if_owner(key, token, ttl).await
        }

        async fn release_if_owner(&self, key: &str, token: &str) -> Result<bool> {
            self.inner.release_if_owner(key, token).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn list_len(&self, key: &str) -> Result<i64> {
            self.inner.list_len(key).await
        }

        async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
            self.inner.pttl(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn del(&self, keys: &[String]) -> Result<u64> {
            self.inner.del(keys).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_error_recovers_signal() {
        let store: Arc<dyn ScriptedStore> = Arc::new(FlakyRefreshStore {
            inner: MemoryStore::new(),
            failures: std::sync::atomic::AtomicUsize::new(1),
        });

        let result = execute_with_lease(
            &store,
            "job:flaky",
            Duration::from_secs(2),
            Duration::from_millis(500),
            |signal| async move {
                // 500ms: 续租失败
                tokio::time::sleep(Duration::from_millis(600)).await;
                let lost_after_error = signal.is_lost();

                // 1000ms: 续租成功
                tokio::time::sleep(Duration::from_millis(500)).await;
                (lost_after_error, signal.is_lost())
            },
        )
        .await
        .unwrap();

        assert_eq!(result, Some((true, false)));
        assert!(!can_acquire(&store, "job:flaky").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_body_stops_renewal() {
        let store = new_store();

        let runner = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                obtain_and_run(&store, "job:e", Duration::from_secs(1), Duration::from_millis(300), async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    panic!("boom");
                })
                .await
            })
        };

        assert!(runner.await.is_err());
        assert!(!can_acquire(&store, "job:e").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(can_acquire(&store, "job:e").await);
    }

    #[tokio::test]
    async fn test_refresh_interval_must_be_shorter_than_ttl() {
        let store = new_store();

        let result = obtain_and_run(&store, "job:f", Duration::from_secs(1), Duration::from_secs(1), async {}).await;

        assert!(matches!(result, Err(CoordError::InvalidInput(_))));
        assert!(can_acquire(&store, "job:f").await);
    }
}
