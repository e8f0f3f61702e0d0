use super::{RawPushReply, ScriptedStore};
use crate::error::Result;
use crate::models::constants::QUEUE_MAX_VAL_SUFFIX;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, RedisResult, Script, SetExpiry, SetOptions};
use std::time::Duration;
use tracing::{error, info};

/// 有界写入脚本
///
/// - KEYS[1]: 队列键名
/// - ARGV[1]: 队列最大长度
/// - ARGV[2..]: 待写入的元素
///
/// 返回 `{写入个数, 最高水位, 队尾元素}`，不存在的值用空字符串表示（Lua table中不能放nil）
///
/// 通过容量检查之后分批 `RPUSH`，整个脚本仍然是一次原子执行
const BOUNDED_PUSH_LUA: &str = r"
local function greater(a, b)
    if #a ~= #b then
        return #a > #b
    end
    return a > b
end

local key = KEYS[1]
local maxKey = key .. '__MAX_VAL_SUFFIX__'
local maxLen = tonumber(ARGV[1])
local pushCount = #ARGV - 1

local maxVal = redis.call('GET', maxKey) or ''
local lastVal = redis.call('LINDEX', key, -1) or ''

local curLen = redis.call('LLEN', key)
if pushCount == 0 or curLen + pushCount > maxLen then
    return {0, maxVal, lastVal}
end

for i = 2, #ARGV do
    if maxVal == '' or greater(ARGV[i], maxVal) then
        maxVal = ARGV[i]
    end
end

-- unpack受Lua C栈限制（约8000个），分批写入
for i = 2, #ARGV, __PUSH_CHUNK__ do
    redis.call('RPUSH', key, unpack(ARGV, i, math.min(i + __PUSH_CHUNK__ - 1, #ARGV)))
end
redis.call('SET', maxKey, maxVal)

local ttl = redis.call('PTTL', key)
if ttl > 0 then
    redis.call('PEXPIRE', maxKey, ttl)
end

return {pushCount, maxVal, ARGV[#ARGV]}
";

/// 单次 `RPUSH` 最多展开的元素个数
const PUSH_CHUNK: usize = 1000;

/// 批量取出脚本
///
/// - KEYS[1]: 队列键名
/// - ARGV[1]: 最多取出的个数
const DRAIN_POP_LUA: &str = r"
local vals = redis.call('LRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)

if #vals > 0 then
    redis.call('LTRIM', KEYS[1], #vals, -1)
end

return vals
";

const EXTEND_IF_OWNER_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end

return 0
";

const RELEASE_IF_OWNER_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end

return 0
";

/// 基于Redis的 [`ScriptedStore`] 实现
///
/// 内部使用 [`ConnectionManager`]，断线后会自动重连，clone的成本很低，可以在多个协程中直接clone使用。
/// 所有原子操作都通过 [`Script`] 执行（优先EVALSHA，脚本未加载时自动回退到EVAL）。
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    push_script: Script,
    pop_script: Script,
    extend_script: Script,
    release_script: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            push_script: Script::new(&bounded_push_source()),
            pop_script: Script::new(DRAIN_POP_LUA),
            extend_script: Script::new(EXTEND_IF_OWNER_LUA),
            release_script: Script::new(RELEASE_IF_OWNER_LUA),
        }
    }

    /// 连接Redis并打印服务端版本
    ///
    /// 连接失败时直接返回错误，调用方需要把它当作依赖不可用处理
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let conn = ConnectionManager::new(redis::Client::open(conn_str)?).await?;
        let store = Self::new(conn);

        store.log_server_info(conn_str).await;

        Ok(store)
    }

    async fn log_server_info(&self, conn_str: &str) {
        let mut conn = self.conn.clone();

        let info: RedisResult<String> = redis::cmd("INFO").arg("server").query_async(&mut conn).await;
        let version = info
            .ok()
            .and_then(|info| parse_redis_version(&info))
            .unwrap_or_else(|| "N/a".to_string());

        let ping: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match ping {
            Ok(_) => info!("Redis-Client-Connect-Succeed: ServerVersion={}, Addr={}", version, conn_str),
            Err(err) => error!(
                "Redis-Client-Connect-Failed: ServerVersion={}, Addr={}, Error={}",
                version, conn_str, err
            ),
        }
    }
}

fn bounded_push_source() -> String {
    BOUNDED_PUSH_LUA
        .replace("__MAX_VAL_SUFFIX__", QUEUE_MAX_VAL_SUFFIX)
        .replace("__PUSH_CHUNK__", &PUSH_CHUNK.to_string())
}

fn parse_redis_version(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .map(|version| version.trim().to_string())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX/PEXPIRE 不接受0
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl ScriptedStore for RedisStore {
    async fn bounded_push(&self, key: &str, max_len: i64, values: &[String]) -> Result<RawPushReply> {
        let mut conn = self.conn.clone();

        let (pushed, max_val, last_val): (i64, String, String) = self
            .push_script
            .key(key)
            .arg(max_len)
            .arg(values)
            .invoke_async(&mut conn)
            .await?;

        Ok(RawPushReply {
            pushed,
            max_val: non_empty(max_val),
            last_val: non_empty(last_val),
        })
    }

    async fn drain_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();

        let values: Vec<String> = self.pop_script.key(key).arg(count).invoke_async(&mut conn).await?;

        Ok(values)
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        let result: Option<String> = conn
            .set_options(
                key,
                token,
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .with_expiration(SetExpiry::PX(millis(ttl))),
            )
            .await?;

        Ok(result.is_some())
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }

    async fn release_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let released: i64 = self.release_script.key(key).arg(token).invoke_async(&mut conn).await?;

        Ok(released == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn list_len(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.pttl(key).await?;

        // -2: 键不存在，-1: 没有过期时间
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(ttl as u64)))
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.pexpire(key, millis(ttl) as i64).await?)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        Ok(conn.del(keys).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_redis_version() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_git_sha1:00000000\r\n";
        assert_eq!(parse_redis_version(info).as_deref(), Some("7.2.4"));
        assert_eq!(parse_redis_version("# Server\r\n"), None);
    }

    #[test]
    fn test_push_script_placeholders_are_filled() {
        let script = bounded_push_source();
        assert!(script.contains("key .. ':maxval'"));
        assert!(script.contains("for i = 2, #ARGV, 1000 do"));
        assert!(script.contains("math.min(i + 1000 - 1, #ARGV)"));
        assert!(!script.contains("__"));
    }

    #[test]
    fn test_push_script_never_unpacks_whole_argv() {
        assert!(!bounded_push_source().contains("unpack(ARGV, 2)"));
    }
}
