use crate::store::Store;
use anyhow::{Context, Result};
use log::*;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Synchronous Redis client. Owns a tokio runtime and drives a reconnecting
/// connection manager on it, so callers never need an async context.
///
/// Must not be used from inside another tokio runtime (`block_on` panics there).
pub struct RedisClient {
    rt: Runtime,
    conn: ConnectionManager,
    delete_if_equals: redis::Script,
}

impl RedisClient {
    /// Connects to `url`, e.g. `redis://127.0.0.1:6379`.
    pub fn connect(url: &str) -> Result<RedisClient> {
        let rt = Runtime::new().context("tokio runtime")?;
        let client = redis::Client::open(url).with_context(|| format!("bad redis url {url}"))?;
        let conn = rt
            .block_on(ConnectionManager::new(client))
            .with_context(|| format!("connect to {url} failed"))?;

        info!("connected to {url}");
        Ok(RedisClient {
            rt,
            conn,
            delete_if_equals: redis::Script::new(DELETE_IF_EQUALS),
        })
    }

    fn run<T, F, Fut>(&self, f: F) -> T
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = T>,
    {
        // ConnectionManager clones share the underlying multiplexed connection.
        self.rt.block_on(f(self.conn.clone()))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.run(|mut conn| async move {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SET {key} failed"))?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.run(|mut conn| async move {
            let v: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("GET {key} failed"))?;
            Ok(v)
        })
    }

    /// Stores `value` as JSON under `key`.
    pub fn set_entity<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).with_context(|| format!("encode {key}"))?;
        self.set(key, &json)
    }

    /// Reads the JSON under `key` into `T`. `Ok(None)` if the key is absent.
    pub fn get_entity<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(json) => {
                let v = serde_json::from_str(&json).with_context(|| format!("decode {key}"))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
}

impl Store for RedisClient {
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.run(|mut conn| async move {
            let set: bool = redis::cmd("SETNX")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SETNX {key} failed"))?;
            Ok(set)
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        RedisClient::get(self, key)
    }

    fn swap(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.run(|mut conn| async move {
            let prev: Option<String> = redis::cmd("GETSET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("GETSET {key} failed"))?;
            Ok(prev)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.run(|mut conn| async move {
            let n: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("DEL {key} failed"))?;
            debug!("DEL {key}: {n}");
            Ok(())
        })
    }

    fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let script = &self.delete_if_equals;
        self.run(|mut conn| async move {
            let n: i64 = script
                .key(key)
                .arg(value)
                .invoke_async(&mut conn)
                .await
                .with_context(|| format!("compare-and-delete {key} failed"))?;
            Ok(n > 0)
        })
    }
}
