use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// The default key of the sequencer lock.
pub const DEFAULT_LOCK_KEY: &str = "keel.sequencer.lockout";

/// Takes the lock if it is free, or extends it if the caller already holds it.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return 1
end
return 0
"#;

/// Renews the lock only if it is still held by the caller.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Deletes the lock only if it is still held by the caller.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Errors returned by a [`LockService`].
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The Redis backend failed or is unreachable.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// The lock service is unavailable.
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// A shared, exclusive, time-bounded lock.
///
/// At most one identity holds the lock at any time. A holder keeps it by renewing it before
/// its TTL elapses; otherwise any other identity can acquire it.
#[async_trait]
pub trait LockService: Debug + Send + Sync {
    /// Try to acquire the lock for `identity`. Returns `true` if the lock is now held by it.
    /// Acquiring a lock already held by `identity` extends it by `ttl`.
    async fn acquire(&self, identity: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Extend the lock held by `identity`. Returns `false` if it does not hold it anymore.
    async fn renew(&self, identity: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release the lock if held by `identity`. Returns `true` if it was released.
    async fn release(&self, identity: &str) -> Result<bool, LockError>;

    /// Returns the identity of the current holder, if any.
    async fn holder(&self) -> Result<Option<String>, LockError>;
}

/// A [`LockService`] backed by a single Redis key.
#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    key: String,
}

impl Debug for RedisLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockService").field("key", &self.key).finish()
    }
}

impl RedisLockService {
    /// Connect to the Redis instance at `url`, using `key` as lock.
    pub async fn connect(url: &Url, key: impl Into<String>) -> Result<Self, LockError> {
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, key: key.into() })
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, identity: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let acquired: i64 = Script::new(ACQUIRE_SCRIPT)
            .key(&self.key)
            .arg(identity)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew(&self, identity: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(identity)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, identity: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let released: i64 =
            Script::new(RELEASE_SCRIPT).key(&self.key).arg(identity).invoke_async(&mut conn).await?;
        Ok(released == 1)
    }

    async fn holder(&self) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(&self.key).await?;
        Ok(holder)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// An in-process [`LockService`], shared by cloning. Expiry follows the tokio clock so that
/// it can be driven by paused-time tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockService {
    lease: Arc<Mutex<Option<Lease>>>,
    unavailable: Arc<Mutex<HashMap<String, bool>>>,
}

impl MemoryLockService {
    /// Create a new, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call from `identity` fail as if the service was unreachable from it.
    pub fn set_unavailable(&self, identity: &str, unavailable: bool) {
        if let Ok(mut map) = self.unavailable.lock() {
            map.insert(identity.to_owned(), unavailable);
        }
    }

    fn check_available(&self, identity: &str) -> Result<(), LockError> {
        let unavailable = self
            .unavailable
            .lock()
            .map(|map| map.get(identity).copied().unwrap_or_default())
            .unwrap_or_default();

        if unavailable {
            return Err(LockError::Unavailable(format!("unreachable from {identity}")));
        }
        Ok(())
    }

    fn with_lease<T>(&self, f: impl FnOnce(&mut Option<Lease>) -> T) -> Result<T, LockError> {
        let mut guard =
            self.lease.lock().map_err(|_| LockError::Unavailable("poisoned lock".to_owned()))?;

        // Drop the lease once expired
        if guard.as_ref().is_some_and(|lease| lease.expires_at <= Instant::now()) {
            debug!("In-memory lease expired");
            *guard = None;
        }

        Ok(f(&mut guard))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, identity: &str, ttl: Duration) -> Result<bool, LockError> {
        self.check_available(identity)?;
        self.with_lease(|lease| match lease {
            Some(current) if current.holder == identity => {
                current.expires_at = Instant::now() + ttl;
                true
            }
            Some(_) => false,
            None => {
                *lease = Some(Lease {
                    holder: identity.to_owned(),
                    expires_at: Instant::now() + ttl,
                });
                true
            }
        })
    }

    async fn renew(&self, identity: &str, ttl: Duration) -> Result<bool, LockError> {
        self.check_available(identity)?;
        self.with_lease(|lease| match lease {
            Some(current) if current.holder == identity => {
                current.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        })
    }

    async fn release(&self, identity: &str) -> Result<bool, LockError> {
        self.check_available(identity)?;
        self.with_lease(|lease| {
            if lease.as_ref().is_some_and(|current| current.holder == identity) {
                *lease = None;
                true
            } else {
                false
            }
        })
    }

    async fn holder(&self) -> Result<Option<String>, LockError> {
        self.with_lease(|lease| lease.as_ref().map(|current| current.holder.clone()))
    }
}
