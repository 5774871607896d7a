//! In-process storage adapter.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::adapter::{BackendError, StorageAdapter};

#[derive(Debug, Clone)]
enum Stored {
    Value(Bytes),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    stored: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(stored: Stored, ttl: Option<Duration>) -> Self {
        Self {
            stored,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// [`StorageAdapter`] over a concurrent hash map.
///
/// Expired entries are dropped lazily when touched. Per-key atomicity comes
/// from the shard lock held by the map's entry API.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    slots: DashMap<String, Slot>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.slots
            .get(key)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| !slot.is_expired(now) && slot.key().starts_with(prefix))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Occupied entry for `key`, or a vacant one when the old slot expired.
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                debug!(key, "expired entry evicted");
                occupied.remove();
                self.slots.entry(key.to_string())
            }
            entry => entry,
        }
    }
}

impl StorageAdapter for MemoryAdapter {
    fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let now = Instant::now();
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if slot.is_expired(now) {
            drop(slot);
            self.slots.remove_if(key, |_, slot| slot.is_expired(now));
            return Ok(None);
        }
        match &slot.stored {
            Stored::Value(value) => Ok(Some(value.clone())),
            Stored::Set(_) => Err(BackendError::wrong_type(key)),
        }
    }

    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.slots
            .insert(key.to_string(), Slot::new(Stored::Value(value), ttl));
        Ok(())
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<Bytes, BackendError> {
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match &occupied.get().stored {
                Stored::Value(existing) => Ok(existing.clone()),
                Stored::Set(_) => Err(BackendError::wrong_type(key)),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(Stored::Value(value.clone()), ttl));
                Ok(value)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired(now)))
    }

    fn add_to_set(&self, key: &str, member: &str) -> Result<(), BackendError> {
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => match &mut occupied.get_mut().stored {
                Stored::Set(members) => {
                    members.insert(member.to_string());
                    Ok(())
                }
                Stored::Value(_) => Err(BackendError::wrong_type(key)),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(
                    Stored::Set(BTreeSet::from([member.to_string()])),
                    None,
                ));
                Ok(())
            }
        }
    }

    fn read_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, BackendError> {
        let now = Instant::now();
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if slot.is_expired(now) {
            return Ok(None);
        }
        match &slot.stored {
            Stored::Set(members) => Ok(Some(members.clone())),
            Stored::Value(_) => Err(BackendError::wrong_type(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn set_then_get() {
        let adapter = MemoryAdapter::new();
        adapter
            .set("a", Bytes::from_static(b"1"), None)
            .expect("set");
        assert_eq!(adapter.get("a").expect("get"), Some(Bytes::from_static(b"1")));
        assert_eq!(adapter.get("missing").expect("get"), None);
    }

    #[test]
    fn set_if_absent_keeps_first_value() {
        let adapter = MemoryAdapter::new();
        let first = adapter
            .set_if_absent("a", Bytes::from_static(b"first"), None)
            .expect("first write");
        let second = adapter
            .set_if_absent("a", Bytes::from_static(b"second"), None)
            .expect("second write");

        assert_eq!(first, Bytes::from_static(b"first"));
        assert_eq!(second, Bytes::from_static(b"first"));
    }

    #[test]
    fn delete_reports_presence() {
        let adapter = MemoryAdapter::new();
        adapter
            .set("a", Bytes::from_static(b"1"), None)
            .expect("set");

        assert!(adapter.delete("a").expect("delete"));
        assert!(!adapter.delete("a").expect("delete again"));
    }

    #[test]
    fn expired_entries_are_absent() {
        let adapter = MemoryAdapter::new();
        adapter
            .set("a", Bytes::from_static(b"1"), Some(Duration::ZERO))
            .expect("set");

        assert_eq!(adapter.get("a").expect("get"), None);
        assert!(!adapter.contains_key("a"));
        assert!(adapter.is_empty());

        let stored = adapter
            .set_if_absent("a", Bytes::from_static(b"2"), None)
            .expect("set_if_absent over expired slot");
        assert_eq!(stored, Bytes::from_static(b"2"));
    }

    #[test]
    fn sets_deduplicate_members() {
        let adapter = MemoryAdapter::new();
        adapter.add_to_set("s", "i:1").expect("add");
        adapter.add_to_set("s", "i:1").expect("add again");
        adapter.add_to_set("s", "i:2").expect("add other");

        let members = adapter.read_set("s").expect("read").expect("set exists");
        assert_eq!(members.len(), 2);
        assert_eq!(adapter.read_set("never").expect("read"), None);
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let adapter = MemoryAdapter::new();
        adapter
            .set("v", Bytes::from_static(b"1"), None)
            .expect("set");
        adapter.add_to_set("s", "x").expect("add");

        assert!(matches!(
            adapter.add_to_set("v", "x"),
            Err(BackendError::WrongType { .. })
        ));
        assert!(matches!(adapter.get("s"), Err(BackendError::WrongType { .. })));
        assert!(matches!(
            adapter.read_set("v"),
            Err(BackendError::WrongType { .. })
        ));
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let adapter = Arc::new(MemoryAdapter::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let adapter = Arc::clone(&adapter);
                thread::spawn(move || {
                    for n in 0..50 {
                        adapter
                            .add_to_set("s", &format!("{worker}:{n}"))
                            .expect("add");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker finished");
        }

        let members = adapter.read_set("s").expect("read").expect("set exists");
        assert_eq!(members.len(), 400);
    }

    #[test]
    fn prefix_listing_and_clear() {
        let adapter = MemoryAdapter::new();
        adapter
            .set("ts#A/1/x", Bytes::from_static(b"1"), None)
            .expect("set");
        adapter
            .set("A/1/x/1", Bytes::from_static(b"1"), None)
            .expect("set");

        assert_eq!(adapter.keys_with_prefix("ts#"), vec!["ts#A/1/x".to_string()]);
        assert_eq!(adapter.len(), 2);

        adapter.clear();
        assert!(adapter.is_empty());
    }
}
