//! Distributed mutual exclusion over a plain key-value store.
//!
//! A lock is a single key (`prefix + resource`) whose value is the absolute
//! expiry time in epoch milliseconds. Acquisition uses `SETNX`; a record whose
//! expiry has passed is reclaimed with `GETSET`, and the reclaimer wins only if
//! the value it displaced is the stale value it read. No in-process state is
//! shared between callers; every guarantee comes from the store.

mod cancel;
mod client;
mod store;

pub use cancel::Cancel;
pub use client::RedisClient;
pub use store::{MemStore, Store};

use anyhow::{Context, Result, bail};
use exp_backoff::BackoffBuilder;
use log::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Upper bound for every millisecond setting on [`LockBuilder`]. Keeps the
/// budget arithmetic (`retry_ms * 2`, `now + ttl`) inside `i64`.
pub const MAX_MS: u64 = i64::MAX as u64 / 4;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Proof of a successful acquisition: the lock key and the exact value this
/// holder wrote there. Not `Clone`; [`Lock::release_token`] consumes it, so a
/// spent token cannot delete a later holder's record carrying the same value.
#[derive(Debug, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    value: String,
    expires_ms: i64,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expiry written by this holder, epoch ms.
    pub fn expires_ms(&self) -> i64 {
        self.expires_ms
    }
}

/// Outcome of [`Lock::try_acquire`].
#[derive(Debug)]
pub enum Acquired {
    Held(LockToken),
    TimedOut,
    Cancelled,
}

impl Acquired {
    pub fn is_held(&self) -> bool {
        matches!(self, Acquired::Held(_))
    }
}

pub struct Lock {
    store: Arc<dyn Store>,
    id: String,
    prefix: String,
    ttl_ms: u64,
    timeout_ms: u64,
    retry_ms: u64,
    backoff: bool,
    closed: Cancel,
}

impl Lock {
    pub fn builder() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tries to take the lock for `resource`, retrying until the timeout.
    /// `Ok(false)` covers both timing out and being interrupted by [`Lock::close`].
    pub fn acquire(&self, resource: &str) -> Result<bool> {
        Ok(self.try_acquire(resource, &self.closed)?.is_held())
    }

    /// Same loop as [`Lock::acquire`], but reports why it stopped and hands
    /// back a token for [`Lock::release_token`]. Firing `cancel`, or closing
    /// this `Lock`, aborts the retry wait promptly.
    pub fn try_acquire(&self, resource: &str, cancel: &Cancel) -> Result<Acquired> {
        let key = self.key(resource);
        let start = Instant::now();
        let stop = Cancel::new();
        cancel.attach(&stop);
        self.closed.attach(&stop);

        let min = (self.retry_ms / 2).max(1);
        let max = self.retry_ms * 2;
        let mut bo = self
            .backoff
            .then(|| BackoffBuilder::new().initial_ns(min).max_ns(max).build());

        let mut remaining = self.timeout_ms as i64;
        while remaining >= 0 {
            if stop.is_cancelled() {
                warn!("[{}] acquire of {key} cancelled", self.id);
                return Ok(Acquired::Cancelled);
            }

            if let Some(token) = self.attempt(&key)? {
                info!("[{}] acquired {key}, took {:?}", self.id, start.elapsed());
                return Ok(Acquired::Held(token));
            }

            let pause = match bo.as_mut() {
                Some(b) => b.pause().clamp(min, max),
                None => self.retry_ms,
            };

            remaining -= pause as i64;
            if remaining < 0 {
                break;
            }

            warn!("[{}] {key} is held, retry in {pause}ms", self.id);
            if stop.wait(Duration::from_millis(pause)) {
                warn!("[{}] wait for {key} cancelled", self.id);
                return Ok(Acquired::Cancelled);
            }
        }

        info!("[{}] gave up on {key} after {:?}", self.id, start.elapsed());
        Ok(Acquired::TimedOut)
    }

    fn attempt(&self, key: &str) -> Result<Option<LockToken>> {
        let expires = now_ms() + self.ttl_ms as i64 + 1;
        let value = expires.to_string();
        if self.store.set_if_absent(key, &value)? {
            return Ok(Some(self.token(key, expires)));
        }

        let current = match self.store.get(key)? {
            Some(v) => v,
            None => return Ok(None), // released in between; next round
        };

        if parse_expiry(key, &current)? >= now_ms() {
            return Ok(None);
        }

        // Stale. Whoever swaps first sees the stale value come back.
        let previous = self.store.swap(key, &value)?;
        if previous.as_deref() == Some(current.as_str()) {
            info!("[{}] reclaimed stale {key} (expired at {current})", self.id);
            return Ok(Some(self.token(key, expires)));
        }

        debug!("[{}] lost reclaim race on {key}", self.id);
        Ok(None)
    }

    /// Deletes the lock for `resource` whoever holds it. Idempotent.
    pub fn release(&self, resource: &str) -> Result<()> {
        let key = self.key(resource);
        self.store.delete(&key)?;
        info!("[{}] released {key}", self.id);
        Ok(())
    }

    /// Deletes the lock only if it still holds the value this holder wrote.
    /// Returns false if it expired and was reclaimed, or was deleted by
    /// [`Lock::release`].
    pub fn release_token(&self, token: LockToken) -> Result<bool> {
        let deleted = self.store.delete_if_equals(&token.key, &token.value)?;
        if deleted {
            info!("[{}] released {}", self.id, token.key);
        } else {
            warn!("[{}] {} no longer held by us", self.id, token.key);
        }

        Ok(deleted)
    }

    /// Runs `f` while holding the lock for `resource`. `Ok(None)` if the lock
    /// could not be taken. The lock is released even if `f` panics.
    pub fn with_lock<T>(&self, resource: &str, f: impl FnOnce() -> T) -> Result<Option<T>> {
        let token = match self.try_acquire(resource, &self.closed)? {
            Acquired::Held(t) => t,
            _ => return Ok(None),
        };

        let guard = scopeguard::guard(token, |t| {
            let key = t.key.clone();
            if let Err(e) = self.release_token(t) {
                error!("[{}] release {key} failed: {e:#}", self.id);
            }
        });

        let out = f();
        let token = scopeguard::ScopeGuard::into_inner(guard);
        self.release_token(token)?;
        Ok(Some(out))
    }

    /// True if a non-expired lock record exists for `resource`.
    pub fn is_locked(&self, resource: &str) -> Result<bool> {
        let key = self.key(resource);
        match self.store.get(&key)? {
            Some(v) => Ok(parse_expiry(&key, &v)? >= now_ms()),
            None => Ok(false),
        }
    }

    /// Interrupts pending and future acquisitions made through this `Lock`.
    pub fn close(&self) {
        info!("[{}] closing", self.id);
        self.closed.cancel();
    }

    fn key(&self, resource: &str) -> String {
        format!("{}{}", self.prefix, resource)
    }

    fn token(&self, key: &str, expires_ms: i64) -> LockToken {
        LockToken {
            key: key.to_string(),
            value: expires_ms.to_string(),
            expires_ms,
        }
    }
}

fn parse_expiry(key: &str, v: &str) -> Result<i64> {
    v.trim()
        .parse::<i64>()
        .with_context(|| format!("corrupted lock record at {key}: {v:?}"))
}

pub struct LockBuilder {
    store: Option<Arc<dyn Store>>,
    id: String,
    prefix: String,
    ttl_ms: u64,
    timeout_ms: u64,
    retry_ms: u64,
    backoff: bool,
}

impl Default for LockBuilder {
    fn default() -> Self {
        LockBuilder {
            store: None,
            id: String::new(),
            prefix: "lock:".to_string(),
            ttl_ms: 60_000,
            timeout_ms: 10_000,
            retry_ms: 1_000,
            backoff: false,
        }
    }
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> LockBuilder {
        self.store = Some(store);
        self
    }

    /// Name used in logs. Defaults to a random UUID.
    pub fn id(mut self, id: String) -> LockBuilder {
        self.id = id;
        self
    }

    pub fn prefix(mut self, prefix: String) -> LockBuilder {
        self.prefix = prefix;
        self
    }

    /// How long a lock is honored before others may reclaim it.
    pub fn ttl_ms(mut self, ms: u64) -> LockBuilder {
        self.ttl_ms = ms;
        self
    }

    /// Total retry budget for one acquisition.
    pub fn timeout_ms(mut self, ms: u64) -> LockBuilder {
        self.timeout_ms = ms;
        self
    }

    pub fn retry_ms(mut self, ms: u64) -> LockBuilder {
        self.retry_ms = ms;
        self
    }

    /// Jittered exponential pauses between `retry_ms / 2` and `retry_ms * 2`
    /// instead of a fixed `retry_ms`.
    pub fn backoff(mut self, on: bool) -> LockBuilder {
        self.backoff = on;
        self
    }

    pub fn build(self) -> Result<Lock> {
        let store = match self.store {
            Some(s) => s,
            None => bail!("no store configured"),
        };

        if self.retry_ms == 0 {
            bail!("retry_ms must be greater than zero");
        }

        for (name, ms) in [
            ("ttl_ms", self.ttl_ms),
            ("timeout_ms", self.timeout_ms),
            ("retry_ms", self.retry_ms),
        ] {
            if ms > MAX_MS {
                bail!("{name} must be at most {MAX_MS}, got {ms}");
            }
        }

        let id = if self.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.id
        };

        info!(
            "id={id}, prefix={}, ttl={:?}, timeout={:?}, retry={:?}, backoff={}",
            self.prefix,
            Duration::from_millis(self.ttl_ms),
            Duration::from_millis(self.timeout_ms),
            Duration::from_millis(self.retry_ms),
            self.backoff
        );

        Ok(Lock {
            store,
            id,
            prefix: self.prefix,
            ttl_ms: self.ttl_ms,
            timeout_ms: self.timeout_ms,
            retry_ms: self.retry_ms,
            backoff: self.backoff,
            closed: Cancel::new(),
        })
    }
}
