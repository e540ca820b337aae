//! Per-tenant mutex backed by an external key-value store.
//!
//! At most one job per tenant runs anywhere in the cluster. The mutex lives
//! in the KV service, never in process memory, so it holds across worker
//! processes. Acquisition is `SET NX PX`; refresh and release compare the
//! stored owner before acting (Lua CAS) so a worker can never extend or drop
//! a lock it lost.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

const KEY_PREFIX: &str = "tenant-lock:";

/// Refresh only when we still own the key.
const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Delete only when we still own the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Cluster-wide per-tenant mutex.
#[async_trait]
pub trait TenantLocks: Send + Sync {
    /// Try to take the tenant lock. Returns false when another owner holds it.
    async fn acquire(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend the TTL, only if `owner` still holds the lock.
    async fn refresh(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lock, only if `owner` still holds it. Releasing a foreign
    /// lock is a no-op.
    async fn release(&self, tenant: &str, owner: &str) -> Result<()>;
}

/// Redis-backed implementation.
pub struct RedisTenantLocks {
    conn: ConnectionManager,
}

impl RedisTenantLocks {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect from a redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid KV url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to KV store")?;
        Ok(Self::new(conn))
    }

    fn key(tenant: &str) -> String {
        format!("{KEY_PREFIX}{tenant}")
    }
}

#[async_trait]
impl TenantLocks for RedisTenantLocks {
    async fn acquire(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::key(tenant))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .context("tenant lock acquire failed")?;
        Ok(set.is_some())
    }

    async fn refresh(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(REFRESH_SCRIPT)
            .key(Self::key(tenant))
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .context("tenant lock refresh failed")?;
        Ok(extended == 1)
    }

    async fn release(&self, tenant: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(Self::key(tenant))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .context("tenant lock release failed")?;
        Ok(())
    }
}

/// In-memory implementation for tests.
#[derive(Default)]
pub struct MemoryTenantLocks {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryTenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of a tenant lock, if any.
    pub fn owner(&self, tenant: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(tenant)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl TenantLocks for MemoryTenantLocks {
    async fn acquire(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(tenant) {
            Some((current, expires)) if *expires > now && current.as_str() != owner => Ok(false),
            _ => {
                locks.insert(tenant.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn refresh(&self, tenant: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get_mut(tenant) {
            Some((current, expires)) if *expires > now && current.as_str() == owner => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, tenant: &str, owner: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if let Some((current, _)) = locks.get(tenant) {
            if current.as_str() == owner {
                locks.remove(tenant);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn second_owner_is_rejected_while_held() {
        let locks = MemoryTenantLocks::new();
        assert!(locks.acquire("shop", "w1", TTL).await.unwrap());
        assert!(!locks.acquire("shop", "w2", TTL).await.unwrap());
        assert_eq!(locks.owner("shop").as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn release_is_owner_checked() {
        let locks = MemoryTenantLocks::new();
        locks.acquire("shop", "w1", TTL).await.unwrap();
        locks.release("shop", "w2").await.unwrap();
        // Still held by w1.
        assert!(!locks.acquire("shop", "w2", TTL).await.unwrap());
        locks.release("shop", "w1").await.unwrap();
        assert!(locks.acquire("shop", "w2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_fails_for_non_owner_and_expired_locks() {
        let locks = MemoryTenantLocks::new();
        locks
            .acquire("shop", "w1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!locks.refresh("shop", "w1", TTL).await.unwrap());
        assert!(!locks.refresh("shop", "w2", TTL).await.unwrap());
        // Expired lock is free for anyone.
        assert!(locks.acquire("shop", "w2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn different_tenants_do_not_contend() {
        let locks = MemoryTenantLocks::new();
        assert!(locks.acquire("a", "w1", TTL).await.unwrap());
        assert!(locks.acquire("b", "w2", TTL).await.unwrap());
    }
}
