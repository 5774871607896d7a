//! Timestamp tokens.
//!
//! A token is created lazily on first read and replaced on reset. Keys that
//! embed a token become unreachable once it is replaced, which invalidates
//! every format and page variant without enumerating them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::CacheError;

use super::adapter::StorageAdapter;
use super::keys::{self, TimestampScope};

const METRIC_TIMESTAMPS_RESET: &str = "cache_machine_timestamps_reset_total";
const STAMP_SUFFIX: &str = "stamp";

pub struct TimestampRegistry {
    adapter: Arc<dyn StorageAdapter>,
    last_token: AtomicU64,
}

impl TimestampRegistry {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            last_token: AtomicU64::new(0),
        }
    }

    /// Current token for `member` under `scope`, created on first access.
    pub fn get_or_create(&self, scope: &TimestampScope, member: &str) -> Result<String, CacheError> {
        let key = keys::timestamp_key(scope, member)?;
        self.token_at(&key, None)
    }

    /// Drops the token. Returns true when one existed.
    pub fn reset(&self, scope: &TimestampScope, member: &str) -> Result<bool, CacheError> {
        let key = keys::timestamp_key(scope, member)?;
        self.reset_key(&key)
    }

    /// `base` versioned by the current token, plus an optional extra
    /// component.
    pub fn versioned_key(
        &self,
        base: &str,
        scope: &TimestampScope,
        member: &str,
        extra: Option<&str>,
    ) -> Result<String, CacheError> {
        let token = self.get_or_create(scope, member)?;
        Ok(keys::versioned_key(base, &token, extra))
    }

    /// Class-wide token for `resource_type`, optionally per format.
    pub fn class_token(&self, resource_type: &str, format: Option<&str>) -> Result<String, CacheError> {
        let key = keys::class_timestamp_key(resource_type, format)?;
        self.token_at(&key, None)
    }

    /// Drops the class token of `resource_type` for the unformatted variant
    /// and every listed format. Returns how many tokens existed.
    pub fn reset_class<'a>(
        &self,
        resource_type: &str,
        formats: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, CacheError> {
        let mut removed = usize::from(self.reset_key(&keys::class_timestamp_key(resource_type, None)?)?);
        for format in formats {
            let key = keys::class_timestamp_key(resource_type, Some(format))?;
            removed += usize::from(self.reset_key(&key)?);
        }
        Ok(removed)
    }

    /// Token that changes whenever the caller's `stamp` changes.
    ///
    /// The last seen stamp is stored beside the token; a different stamp
    /// drops the old token before a new one is issued.
    pub fn stamped(
        &self,
        scope: &TimestampScope,
        name: &str,
        stamp: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, CacheError> {
        let token_key = keys::timestamp_key(scope, name)?;
        let stamp_key = keys::versioned_key(&token_key, STAMP_SUFFIX, None);

        let previous = self.adapter.get(&stamp_key)?;
        if previous.as_deref() != Some(stamp.as_bytes()) {
            self.reset_key(&token_key)?;
            self.adapter
                .set(&stamp_key, Bytes::copy_from_slice(stamp.as_bytes()), expires_in)?;
            debug!(key = %token_key, stamp, "stamp changed; token replaced");
        }
        self.token_at(&token_key, expires_in)
    }

    fn token_at(&self, key: &str, ttl: Option<Duration>) -> Result<String, CacheError> {
        if let Some(existing) = self.adapter.get(key)? {
            return Ok(decode_token(&existing));
        }
        let fresh = self.next_token().to_string();
        let stored = self.adapter.set_if_absent(key, Bytes::from(fresh), ttl)?;
        debug!(key, "timestamp token created");
        Ok(decode_token(&stored))
    }

    fn reset_key(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.adapter.delete(key)?;
        if removed {
            counter!(METRIC_TIMESTAMPS_RESET).increment(1);
            debug!(key, "timestamp token reset");
        }
        Ok(removed)
    }

    /// Nanoseconds since the epoch, bumped past the last issued token so
    /// tokens from this process never repeat.
    fn next_token(&self) -> u64 {
        let now = u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(0);
        let mut last = self.last_token.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_token
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

fn decode_token(raw: &Bytes) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryAdapter;
    use crate::cache::resource::ResourceRef;

    fn registry() -> (Arc<MemoryAdapter>, TimestampRegistry) {
        let adapter = Arc::new(MemoryAdapter::new());
        let registry = TimestampRegistry::new(adapter.clone());
        (adapter, registry)
    }

    fn scope() -> TimestampScope {
        TimestampScope::Instance(ResourceRef::new("Cacher", 1_i64))
    }

    #[test]
    fn token_is_stable_until_reset() {
        let (_, registry) = registry();
        let first = registry.get_or_create(&scope(), "joins").expect("token");
        let again = registry.get_or_create(&scope(), "joins").expect("token");
        assert_eq!(first, again);

        assert!(registry.reset(&scope(), "joins").expect("reset"));
        let fresh = registry.get_or_create(&scope(), "joins").expect("token");
        assert_ne!(first, fresh);
    }

    #[test]
    fn reset_of_missing_token_reports_false() {
        let (_, registry) = registry();
        assert!(!registry.reset(&scope(), "never").expect("reset"));
    }

    #[test]
    fn tokens_increase_strictly() {
        let (_, registry) = registry();
        let tokens: Vec<u64> = (0..100).map(|_| registry.next_token()).collect();
        assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn versioned_key_changes_after_reset() {
        let (_, registry) = registry();
        let before = registry
            .versioned_key("Cacher/1/joins/1", &scope(), "joins", None)
            .expect("key");
        registry.reset(&scope(), "joins").expect("reset");
        let after = registry
            .versioned_key("Cacher/1/joins/1", &scope(), "joins", None)
            .expect("key");

        assert!(before.starts_with("Cacher/1/joins/1@"));
        assert_ne!(before, after);
    }

    #[test]
    fn class_reset_covers_every_format() {
        let (adapter, registry) = registry();
        registry.class_token("Cacher", None).expect("token");
        registry.class_token("Cacher", Some("json")).expect("token");
        assert_eq!(adapter.keys_with_prefix("cts#Cacher").len(), 2);

        let removed = registry
            .reset_class("Cacher", ["json", "xml"])
            .expect("reset");
        assert_eq!(removed, 2);
        assert!(adapter.keys_with_prefix("cts#Cacher").is_empty());
    }

    #[test]
    fn stamped_token_follows_the_stamp() {
        let (_, registry) = registry();
        let first = registry
            .stamped(&scope(), "updated", "2024-01-01", None)
            .expect("token");
        let same = registry
            .stamped(&scope(), "updated", "2024-01-01", None)
            .expect("token");
        let changed = registry
            .stamped(&scope(), "updated", "2024-02-01", None)
            .expect("token");

        assert_eq!(first, same);
        assert_ne!(first, changed);
    }
}
