//! Cluster-wide mutual exclusion.
//!
//! [`DistributedLock`] is the backend primitive (set-if-absent with a TTL,
//! owner-checked refresh and release). [`LockClient`] layers the two shapes
//! the engine uses on top of it: a fire-and-forget `try_lock` whose lease is
//! left to expire, and `lock_with_renew`, which keeps a lease alive from a
//! background task until the returned [`LockGuard`] is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::EngineError;

/// Backend lock primitive.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `key` for `owner` if it is free or expired.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, EngineError>;

    /// Extend the lease if `owner` still holds it.
    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, EngineError>;

    /// Drop the lease if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, EngineError>;
}

/// Engine-facing lock operations. Backend failures count as "not acquired".
#[derive(Clone)]
pub struct LockClient {
    backend: Arc<dyn DistributedLock>,
    owner: String,
}

impl LockClient {
    pub fn new(backend: Arc<dyn DistributedLock>) -> Self {
        Self {
            backend,
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Non-blocking acquire. The lease is not released by the caller; it
    /// expires after `ttl`.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> bool {
        match self.backend.acquire(key, &self.owner, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(key, error = %e, "Lock acquire failed");
                false
            }
        }
    }

    /// Release a lease taken with [`try_lock`](Self::try_lock).
    pub async fn unlock(&self, key: &str) -> bool {
        match self.backend.release(key, &self.owner).await {
            Ok(released) => released,
            Err(e) => {
                warn!(key, error = %e, "Lock release failed");
                false
            }
        }
    }

    /// Acquire and keep renewing every `ttl / 3` for at most `max_hold`.
    /// When the lease is lost or `max_hold` elapses, `on_lost` is cancelled.
    pub async fn lock_with_renew(
        &self,
        key: &str,
        ttl: Duration,
        max_hold: Duration,
        on_lost: CancellationToken,
    ) -> Option<LockGuard> {
        let owner = Uuid::new_v4().to_string();
        match self.backend.acquire(key, &owner, ttl).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(key, error = %e, "Lock acquire failed");
                return None;
            }
        }
        debug!(key, "Lock acquired with renewal");

        let stop = CancellationToken::new();
        let renew = tokio::spawn(renew_loop(
            self.backend.clone(),
            key.to_string(),
            owner.clone(),
            ttl,
            max_hold,
            stop.clone(),
            on_lost,
        ));
        Some(LockGuard {
            backend: self.backend.clone(),
            key: key.to_string(),
            owner,
            stop,
            renew: Some(renew),
        })
    }
}

async fn renew_loop(
    backend: Arc<dyn DistributedLock>,
    key: String,
    owner: String,
    ttl: Duration,
    max_hold: Duration,
    stop: CancellationToken,
    on_lost: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    let deadline = tokio::time::Instant::now() + max_hold;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(key = %key, "Lock held for its maximum duration, giving it up");
                on_lost.cancel();
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }
        match backend.refresh(&key, &owner, ttl).await {
            Ok(true) => debug!(key = %key, "Lock renewed"),
            Ok(false) => {
                warn!(key = %key, "Lock lease lost");
                on_lost.cancel();
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock renewal failed");
                on_lost.cancel();
                return;
            }
        }
    }
}

/// A renewed lease. Release it with [`release`](Self::release); dropping
/// it releases in the background.
pub struct LockGuard {
    backend: Arc<dyn DistributedLock>,
    key: String,
    owner: String,
    stop: CancellationToken,
    renew: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.stop.cancel();
        if let Some(renew) = self.renew.take() {
            let _ = renew.await;
        }
        match self.backend.release(&self.key, &self.owner).await {
            Ok(true) => debug!(key = %self.key, "Lock released"),
            Ok(false) => debug!(key = %self.key, "Lock already expired"),
            Err(e) => warn!(key = %self.key, error = %e, "Lock release failed"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(renew) = self.renew.take() else {
            return;
        };
        self.stop.cancel();
        renew.abort();
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.release(&key, &owner).await {
                    warn!(key = %key, error = %e, "Lock release on drop failed");
                }
            });
        }
    }
}

struct Lease {
    owner: String,
    expires_at: i64,
}

/// Single-process lock with clock-driven expiry.
pub struct MemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub async fn is_held(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.leases
            .lock()
            .await
            .get(key)
            .is_some_and(|l| l.expires_at > now)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, EngineError> {
        let now = self.clock.now_ms();
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|l| l.expires_at > now) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now.saturating_add(duration_ms(ttl)),
            },
        );
        info!(key, "Lock taken");
        Ok(true)
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, EngineError> {
        let now = self.clock.now_ms();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now.saturating_add(duration_ms(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, EngineError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|l| l.owner == owner) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
