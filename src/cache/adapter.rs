//! Storage adapter boundary.
//!
//! The engine persists three kinds of state: content blobs, association
//! maps and timestamp tokens. Each goes through a [`StorageAdapter`]; the
//! three may share one backend or live in separate ones.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Failure raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("key `{key}` holds a value of another kind")]
    WrongType { key: String },
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }
}

/// Uniform key-value interface over a cache backend.
///
/// Implementations must make `set_if_absent` and `add_to_set` atomic at the
/// backend; callers never read-modify-write.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Stores `value` unless the key already holds one. Returns the value
    /// stored after the call, whichever writer won.
    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<Bytes, BackendError>;

    /// Returns true when something was deleted.
    fn delete(&self, key: &str) -> Result<bool, BackendError>;

    fn add_to_set(&self, key: &str, member: &str) -> Result<(), BackendError>;

    /// `None` when the set was never written.
    fn read_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, BackendError>;
}

impl<T: StorageAdapter + ?Sized> StorageAdapter for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        (**self).set(key, value, ttl)
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<Bytes, BackendError> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        (**self).delete(key)
    }

    fn add_to_set(&self, key: &str, member: &str) -> Result<(), BackendError> {
        (**self).add_to_set(key, member)
    }

    fn read_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, BackendError> {
        (**self).read_set(key)
    }
}

/// Backends for the three kinds of persisted state.
#[derive(Clone)]
pub struct Adapters {
    /// Content blobs.
    pub storage: Arc<dyn StorageAdapter>,
    /// Forward and reverse association maps.
    pub maps: Arc<dyn StorageAdapter>,
    /// Timestamp tokens.
    pub timestamps: Arc<dyn StorageAdapter>,
}

impl Adapters {
    /// One backend for everything.
    pub fn shared(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage: Arc::clone(&adapter),
            maps: Arc::clone(&adapter),
            timestamps: adapter,
        }
    }
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters")
            .field("shared", &self.is_shared())
            .finish_non_exhaustive()
    }
}

impl Adapters {
    fn is_shared(&self) -> bool {
        Arc::ptr_eq(&self.storage, &self.maps) && Arc::ptr_eq(&self.maps, &self.timestamps)
    }
}
