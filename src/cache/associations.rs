//! Forward and reverse association maps.
//!
//! Both directions are cache-aside: a read that finds no built map asks the
//! [`RecordSource`] once and stores the answer; writers only ever append.
//! A map counts as built once it carries [`BUILT_MARKER`], so ids appended
//! to a cold map never masquerade as the complete set.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument};

use crate::error::CacheError;

use super::adapter::StorageAdapter;
use super::keys;
use super::resource::{RecordSource, ResourceId, ResourceRef};

const METRIC_MAP_REBUILD: &str = "cache_machine_map_rebuild_total";

/// Set member flagging a map rebuilt from the record source. Never decodes
/// as an id.
const BUILT_MARKER: &str = "~built";

pub struct AssociationMaps {
    adapter: Arc<dyn StorageAdapter>,
    records: Arc<dyn RecordSource>,
}

impl AssociationMaps {
    pub fn new(adapter: Arc<dyn StorageAdapter>, records: Arc<dyn RecordSource>) -> Self {
        Self { adapter, records }
    }

    /// Ids reachable from `owner` through `collection`.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub fn association_ids(
        &self,
        owner: &ResourceRef,
        collection: &str,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        let key = keys::map_key(owner, collection)?;
        self.read_or_rebuild(&key, || self.records.related_ids(owner, collection))
    }

    /// Idempotently records `id` in the forward map.
    pub fn append_id_to_map(
        &self,
        owner: &ResourceRef,
        collection: &str,
        id: &ResourceId,
    ) -> Result<(), CacheError> {
        let key = keys::map_key(owner, collection)?;
        self.adapter.add_to_set(&key, &id.encode())?;
        debug!(key, id = %id, "id appended to map");
        Ok(())
    }

    /// Ids of `owner_type` records whose `collection` contains `related`.
    #[instrument(skip(self, related), fields(related = %related))]
    pub fn reverse_association_ids(
        &self,
        owner_type: &str,
        collection: &str,
        related: &ResourceRef,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        let key = reverse_bucket(owner_type, collection, related)?;
        self.read_or_rebuild(&key, || {
            self.records.owner_ids(owner_type, collection, related)
        })
    }

    /// Idempotently records `owner_id` in the reverse map of `related`.
    pub fn append_id_to_reverse_map(
        &self,
        owner_type: &str,
        collection: &str,
        related: &ResourceRef,
        owner_id: &ResourceId,
    ) -> Result<(), CacheError> {
        let key = reverse_bucket(owner_type, collection, related)?;
        self.adapter.add_to_set(&key, &owner_id.encode())?;
        debug!(key, owner_id = %owner_id, "id appended to reverse map");
        Ok(())
    }

    /// Records one link in both directions.
    pub fn link(
        &self,
        owner: &ResourceRef,
        collection: &str,
        related: &ResourceRef,
    ) -> Result<(), CacheError> {
        self.append_id_to_map(owner, collection, related.id())?;
        self.append_id_to_reverse_map(owner.resource_type(), collection, related, owner.id())
    }

    /// Builds the forward map of every `owner_type` record for `collection`
    /// and mirrors each link into the reverse map. Returns the number of
    /// links seen.
    pub fn warm(
        &self,
        owner_type: &str,
        collection: &str,
        related_type: &str,
    ) -> Result<usize, CacheError> {
        let mut links = 0;
        let mut seen = BTreeSet::new();
        for owner_id in self.records.resource_ids(owner_type)? {
            let owner = ResourceRef::new(owner_type, owner_id);
            for related_id in self.association_ids(&owner, collection)? {
                let related = ResourceRef::new(related_type, related_id);
                self.append_id_to_reverse_map(owner_type, collection, &related, owner.id())?;
                seen.insert(related);
                links += 1;
            }
        }
        // Every owner has been visited, so the touched reverse maps are complete.
        for related in &seen {
            self.mark_built(&reverse_bucket(owner_type, collection, related)?)?;
        }
        debug!(owner_type, collection, links, "association maps warmed");
        Ok(links)
    }

    fn read_or_rebuild(
        &self,
        key: &str,
        load: impl FnOnce() -> Result<BTreeSet<ResourceId>, CacheError>,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        let stored = self.adapter.read_set(key)?;
        if let Some(members) = stored.as_ref()
            && members.contains(BUILT_MARKER)
        {
            debug!(key, outcome = "hit", "association map read");
            return Ok(decode_ids(members));
        }

        let loaded = load()?;
        for id in &loaded {
            self.adapter.add_to_set(key, &id.encode())?;
        }
        self.mark_built(key)?;
        counter!(METRIC_MAP_REBUILD).increment(1);
        debug!(key, count = loaded.len(), outcome = "rebuilt", "association map read");

        let mut ids = stored.as_ref().map(decode_ids).unwrap_or_default();
        ids.extend(loaded);
        Ok(ids)
    }

    fn mark_built(&self, key: &str) -> Result<(), CacheError> {
        self.adapter.add_to_set(key, BUILT_MARKER)?;
        Ok(())
    }
}

fn reverse_bucket(
    owner_type: &str,
    collection: &str,
    related: &ResourceRef,
) -> Result<String, CacheError> {
    let base = keys::reverse_map_key(related.resource_type(), collection, owner_type)?;
    Ok(keys::bucket_key(&base, related.id()))
}

fn decode_ids(members: &BTreeSet<String>) -> BTreeSet<ResourceId> {
    members.iter().filter_map(|raw| ResourceId::decode(raw)).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::memory::MemoryAdapter;

    #[derive(Default)]
    struct Links {
        forward: Mutex<BTreeMap<(ResourceRef, String), BTreeSet<ResourceId>>>,
        queries: AtomicUsize,
    }

    impl Links {
        fn add(&self, owner: &ResourceRef, collection: &str, id: i64) {
            self.forward
                .lock()
                .expect("lock")
                .entry((owner.clone(), collection.to_string()))
                .or_default()
                .insert(ResourceId::Int(id));
        }
    }

    impl RecordSource for Links {
        fn related_ids(
            &self,
            owner: &ResourceRef,
            collection: &str,
        ) -> Result<BTreeSet<ResourceId>, CacheError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .forward
                .lock()
                .expect("lock")
                .get(&(owner.clone(), collection.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        fn owner_ids(
            &self,
            owner_type: &str,
            collection: &str,
            related: &ResourceRef,
        ) -> Result<BTreeSet<ResourceId>, CacheError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .forward
                .lock()
                .expect("lock")
                .iter()
                .filter(|((owner, name), ids)| {
                    owner.resource_type() == owner_type
                        && name == collection
                        && ids.contains(related.id())
                })
                .map(|((owner, _), _)| owner.id().clone())
                .collect())
        }

        fn resource_ids(&self, resource_type: &str) -> Result<Vec<ResourceId>, CacheError> {
            Ok(self
                .forward
                .lock()
                .expect("lock")
                .keys()
                .filter(|(owner, _)| owner.resource_type() == resource_type)
                .map(|(owner, _)| owner.id().clone())
                .collect())
        }
    }

    fn maps() -> (Arc<Links>, AssociationMaps) {
        let links = Arc::new(Links::default());
        let maps = AssociationMaps::new(Arc::new(MemoryAdapter::new()), links.clone());
        (links, maps)
    }

    #[test]
    fn miss_queries_once_then_serves_from_cache() {
        let (links, maps) = maps();
        let owner = ResourceRef::new("Cacher", 1_i64);
        links.add(&owner, "joins", 10);

        let first = maps.association_ids(&owner, "joins").expect("ids");
        let second = maps.association_ids(&owner, "joins").expect("ids");

        assert_eq!(first, BTreeSet::from([ResourceId::Int(10)]));
        assert_eq!(first, second);
        assert_eq!(links.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_collections_are_cached_too() {
        let (links, maps) = maps();
        let owner = ResourceRef::new("Cacher", 1_i64);

        assert!(maps.association_ids(&owner, "joins").expect("ids").is_empty());
        assert!(maps.association_ids(&owner, "joins").expect("ids").is_empty());
        assert_eq!(links.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn appends_are_idempotent_and_survive_rebuild() {
        let (links, maps) = maps();
        let owner = ResourceRef::new("Cacher", 1_i64);
        links.add(&owner, "joins", 10);

        maps.append_id_to_map(&owner, "joins", &ResourceId::Int(11))
            .expect("append");
        maps.append_id_to_map(&owner, "joins", &ResourceId::Int(11))
            .expect("append again");

        let ids = maps.association_ids(&owner, "joins").expect("ids");
        assert_eq!(ids, BTreeSet::from([ResourceId::Int(10), ResourceId::Int(11)]));
        assert_eq!(links.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reverse_lookup_finds_every_owner() {
        let (links, maps) = maps();
        let first = ResourceRef::new("Cacher", 1_i64);
        let second = ResourceRef::new("Cacher", 2_i64);
        links.add(&first, "polymorphics", 7);
        links.add(&second, "polymorphics", 7);

        let related = ResourceRef::new("Polymorphic", 7_i64);
        let owners = maps
            .reverse_association_ids("Cacher", "polymorphics", &related)
            .expect("owners");
        assert_eq!(owners, BTreeSet::from([ResourceId::Int(1), ResourceId::Int(2)]));

        maps.reverse_association_ids("Cacher", "polymorphics", &related)
            .expect("owners");
        assert_eq!(links.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn warm_fills_both_directions() {
        let (links, maps) = maps();
        let owner = ResourceRef::new("Cacher", 1_i64);
        links.add(&owner, "polymorphics", 7);
        links.add(&owner, "polymorphics", 8);

        assert_eq!(maps.warm("Cacher", "polymorphics", "Polymorphic").expect("warm"), 2);
        let queries_after_warm = links.queries.load(Ordering::SeqCst);

        let owners = maps
            .reverse_association_ids("Cacher", "polymorphics", &ResourceRef::new("Polymorphic", 8_i64))
            .expect("owners");
        assert_eq!(owners, BTreeSet::from([ResourceId::Int(1)]));
        assert_eq!(links.queries.load(Ordering::SeqCst), queries_after_warm);

        assert_eq!(maps.warm("Cacher", "polymorphics", "Polymorphic").expect("rewarm"), 2);
    }
}
