use super::{decimal_greater, RawPushReply, ScriptedStore};
use crate::error::{CoordError, Result};
use crate::models::constants::QUEUE_MAX_VAL_SUFFIX;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

type Keyspace = HashMap<String, Entry>;

/// 进程内的 [`ScriptedStore`] 实现
///
/// 每个操作都在同一把互斥锁内完成，效果等同于Redis单线程执行Lua脚本，
/// 因此可以用来验证有界队列和租约锁的并发语义。
///
/// 过期时间使用 [`tokio::time::Instant`]，在 `#[tokio::test(start_paused = true)]` 中可以快进时间。
///
/// 只适合测试和单进程运行，多个进程之间无法共享。
#[derive(Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        // 锁内不会panic，即使被污染数据也是完整的
        self.keyspace.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 读取未过期的键，过期的键会被顺便删除
fn live<'a>(keyspace: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    let expired = keyspace
        .get(key)
        .and_then(|entry| entry.expires_at)
        .is_some_and(|at| at <= Instant::now());

    if expired {
        keyspace.remove(key);
        return None;
    }

    keyspace.get_mut(key)
}

fn wrong_type(key: &str) -> CoordError {
    CoordError::invalid_input(format!("WRONGTYPE operation against key {key} holding the wrong kind of value"))
}

fn read_list<'a>(keyspace: &'a mut Keyspace, key: &str) -> Result<Option<&'a mut VecDeque<String>>> {
    match live(keyspace, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::List(list), ..
        }) => Ok(Some(list)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn read_str(keyspace: &mut Keyspace, key: &str) -> Result<Option<String>> {
    match live(keyspace, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Str(value), ..
        }) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type(key)),
    }
}

#[async_trait]
impl ScriptedStore for MemoryStore {
    async fn bounded_push(&self, key: &str, max_len: i64, values: &[String]) -> Result<RawPushReply> {
        let mut keyspace = self.lock();
        let max_key = format!("{key}{QUEUE_MAX_VAL_SUFFIX}");

        let mut max_val = read_str(&mut keyspace, &max_key)?;
        let (cur_len, last_val) = match read_list(&mut keyspace, key)? {
            Some(list) => (list.len() as i64, list.back().cloned()),
            None => (0, None),
        };

        if values.is_empty() || cur_len + values.len() as i64 > max_len {
            return Ok(RawPushReply {
                pushed: 0,
                max_val,
                last_val,
            });
        }

        for value in values {
            if max_val.as_deref().map_or(true, |current| decimal_greater(value, current)) {
                max_val = Some(value.clone());
            }
        }

        let list_expires_at = match keyspace.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                expires_at,
            }) => {
                list.extend(values.iter().cloned());
                *expires_at
            }
            _ => {
                keyspace.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(values.iter().cloned().collect()),
                        expires_at: None,
                    },
                );
                None
            }
        };

        keyspace.insert(
            max_key,
            Entry {
                value: Value::Str(max_val.clone().unwrap_or_default()),
                expires_at: list_expires_at,
            },
        );

        Ok(RawPushReply {
            pushed: values.len() as i64,
            max_val,
            last_val: values.last().cloned(),
        })
    }

    async fn drain_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut keyspace = self.lock();

        let Some(list) = read_list(&mut keyspace, key)? else {
            return Ok(Vec::new());
        };

        // 与 LRANGE key 0 -1 保持一致：count为0时取出全部
        let take = if count == 0 { list.len() } else { count.min(list.len()) };
        let values: Vec<String> = list.drain(..take).collect();

        if list.is_empty() {
            keyspace.remove(key);
        }

        Ok(values)
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut keyspace = self.lock();

        if live(&mut keyspace, key).is_some() {
            return Ok(false);
        }

        keyspace.insert(
            key.to_string(),
            Entry {
                value: Value::Str(token.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );

        Ok(true)
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut keyspace = self.lock();

        match live(&mut keyspace, key) {
            Some(Entry {
                value: Value::Str(value),
                expires_at,
            }) if value.as_str() == token => {
                *expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut keyspace = self.lock();

        if read_str(&mut keyspace, key).ok().flatten().as_deref() == Some(token) {
            keyspace.remove(key);
            return Ok(true);
        }

        Ok(false)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        read_str(&mut self.lock(), key)
    }

    async fn list_len(&self, key: &str) -> Result<i64> {
        Ok(read_list(&mut self.lock(), key)?.map_or(0, |list| list.len() as i64))
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut keyspace = self.lock();

        Ok(live(&mut keyspace, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut keyspace = self.lock();

        match live(&mut keyspace, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut keyspace = self.lock();

        let mut removed = 0;
        for key in keys {
            if live(&mut keyspace, key).is_some() {
                keyspace.remove(key);
                removed += 1;
            }
        }

        Ok(removed)
    }
}
