use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use callboard_core::Fingerprint;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use thiserror::Error;

pub const DEFAULT_KEY_PREFIX: &str = "callboard:fingerprint";

// An absent key compares equal to the empty expected value.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  current = ''
end
if current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Last published fingerprint per dataset, shared by every poller.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Fingerprint>, StoreError>;

    async fn set(&self, name: &str, value: &Fingerprint) -> Result<(), StoreError>;

    /// Writes `new` only if the stored value still equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&Fingerprint>,
        new: &Fingerprint,
    ) -> Result<bool, StoreError>;

    fn backend(&self) -> &'static str;
}

#[derive(Clone)]
pub struct RedisFingerprintStore {
    redis: ConnectionManager,
    prefix: String,
    cas: Script,
}

impl RedisFingerprintStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::with_manager(redis, prefix))
    }

    pub fn with_manager(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            cas: Script::new(COMPARE_AND_SET),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }
}

#[async_trait]
impl FingerprintStore for RedisFingerprintStore {
    async fn get(&self, name: &str) -> Result<Option<Fingerprint>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(self.key(name)).await?;
        Ok(value.map(Fingerprint::from_stored))
    }

    async fn set(&self, name: &str, value: &Fingerprint) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.key(name), value.as_str()).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&Fingerprint>,
        new: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .cas
            .key(self.key(name))
            .arg(expected.map(Fingerprint::as_str).unwrap_or(""))
            .arg(new.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Process-local store for tests and single-instance development. Counts
/// writes so callers can assert that unchanged cycles leave it alone.
#[derive(Default)]
pub struct MemoryFingerprintStore {
    values: Mutex<HashMap<String, Fingerprint>>,
    writes: AtomicU64,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> HashMap<String, Fingerprint> {
        self.values.lock().clone()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn get(&self, name: &str) -> Result<Option<Fingerprint>, StoreError> {
        Ok(self.values.lock().get(name).cloned())
    }

    async fn set(&self, name: &str, value: &Fingerprint) -> Result<(), StoreError> {
        self.values.lock().insert(name.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&Fingerprint>,
        new: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let mut values = self.values.lock();
        if values.get(name) != expected {
            return Ok(false);
        }
        values.insert(name.to_string(), new.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
