//! Per-key mutation locks
//!
//! Mutations on the same position or pool are serialized; mutations on
//! different keys run concurrently. A second writer that finds the key
//! already marked in-flight while it holds the lock means the lock table
//! itself is broken: the key is halted and stays halted until an operator
//! clears it.

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::{PoolId, PositionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    Position(PositionId),
    Pool(PoolId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Position(id) => write!(f, "position:{}", id),
            LockKey::Pool(id) => write!(f, "pool:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("{0} is halted pending audit")]
    Halted(LockKey),

    #[error("concurrent mutation detected on {0}")]
    ConcurrentMutation(LockKey),
}

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
    in_flight: DashSet<LockKey>,
    halted: DashSet<LockKey>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: LockKey) -> Result<KeyGuard<'_>, LockError> {
        if self.halted.contains(&key) {
            return Err(LockError::Halted(key));
        }

        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        // 대기 중에 halt 되었을 수 있음
        if self.halted.contains(&key) {
            return Err(LockError::Halted(key));
        }

        if !self.in_flight.insert(key) {
            tracing::error!(%key, "in-flight marker already set while holding the lock");
            self.halt(key);
            return Err(LockError::ConcurrentMutation(key));
        }

        Ok(KeyGuard {
            key,
            owner: self,
            _guard: guard,
        })
    }

    /// Block every further mutation of `key`
    pub fn halt(&self, key: LockKey) {
        if self.halted.insert(key) {
            tracing::error!(%key, "key halted");
        }
    }

    pub fn is_halted(&self, key: LockKey) -> bool {
        self.halted.contains(&key)
    }

    /// Lift a halt after audit. Returns `false` if the key was not halted.
    pub fn clear_halt(&self, key: LockKey) -> bool {
        let cleared = self.halted.remove(&key).is_some();
        if cleared {
            tracing::warn!(%key, "halt cleared");
        }
        cleared
    }

    pub fn halted_keys(&self) -> Vec<LockKey> {
        self.halted.iter().map(|k| *k).collect()
    }
}

/// Exclusive access to one key; released on drop
pub struct KeyGuard<'a> {
    key: LockKey,
    owner: &'a KeyedLocks,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.owner.in_flight.remove(&self.key);
    }
}
