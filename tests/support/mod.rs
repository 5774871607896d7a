//! Shared fixtures: an in-memory record layer and a bound cache machine.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cache_machine::{
    Adapters, CacheConfig, CacheError, CacheMachine, CacheMap, ChangedRecord, CollectionConfig,
    EventBus, FetchOptions, LifecycleEvent, MemoryAdapter, RecordSource, Relation, ResourceConfig,
    ResourceId, ResourceRef,
};

/// Link table keyed by `(owner, collection)`, standing in for the database.
#[derive(Default)]
pub struct Records {
    links: Mutex<BTreeMap<(ResourceRef, String), BTreeSet<ResourceId>>>,
    rows: Mutex<BTreeMap<String, BTreeSet<ResourceId>>>,
    queries: AtomicUsize,
}

impl Records {
    pub fn insert(&self, resource: &ResourceRef) {
        self.rows
            .lock()
            .expect("rows lock")
            .entry(resource.resource_type().to_string())
            .or_default()
            .insert(resource.id().clone());
    }

    pub fn link(&self, owner: &ResourceRef, collection: &str, related: impl Into<ResourceId>) {
        self.insert(owner);
        self.links
            .lock()
            .expect("links lock")
            .entry((owner.clone(), collection.to_string()))
            .or_default()
            .insert(related.into());
    }

    pub fn unlink(&self, owner: &ResourceRef, collection: &str, related: impl Into<ResourceId>) {
        let related = related.into();
        if let Some(ids) = self
            .links
            .lock()
            .expect("links lock")
            .get_mut(&(owner.clone(), collection.to_string()))
        {
            ids.remove(&related);
        }
    }

    /// Queries answered so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl RecordSource for Records {
    fn related_ids(
        &self,
        owner: &ResourceRef,
        collection: &str,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .links
            .lock()
            .expect("links lock")
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
            .links
            .lock()
            .expect("links lock")
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
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .get(resource_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub machine: CacheMachine,
    pub adapter: Arc<MemoryAdapter>,
    pub records: Arc<Records>,
    pub bus: EventBus,
}

impl Harness {
    pub fn new(map: CacheMap) -> Self {
        Self::with_config(CacheConfig::default(), map)
    }

    pub fn with_config(config: CacheConfig, map: CacheMap) -> Self {
        let adapter = Arc::new(MemoryAdapter::new());
        let records = Arc::new(Records::default());
        let machine = CacheMachine::new(
            config,
            map,
            Adapters::shared(adapter.clone()),
            records.clone(),
        );
        let bus = EventBus::new();
        machine.bind(&bus);
        Self {
            machine,
            adapter,
            records,
            bus,
        }
    }

    pub fn emit(&self, event: LifecycleEvent, record: ChangedRecord) {
        self.bus.emit(event, &record).expect("handlers succeed");
    }

    /// Fetches `member` and reports whether the compute closure ran.
    pub fn computed(&self, resource: &ResourceRef, member: &str, options: &FetchOptions) -> bool {
        let ran = Cell::new(false);
        let value: String = self
            .machine
            .fetch_cache_of(resource, member, options, || {
                ran.set(true);
                Ok(format!("{resource}:{member}"))
            })
            .expect("fetch succeeds");
        assert_eq!(value, format!("{resource}:{member}"));
        ran.get()
    }

    pub fn warm(&self, resource: &ResourceRef, member: &str) {
        self.computed(resource, member, &FetchOptions::new());
    }

    pub fn is_cached(&self, resource: &ResourceRef, member: &str) -> bool {
        !self.computed(resource, member, &FetchOptions::new())
    }
}

pub fn cacher(id: i64) -> ResourceRef {
    ResourceRef::new("Cacher", id)
}

/// `Cacher` owns a direct collection, a many-to-many collection, a
/// through collection over `Join` and a self-referential collection.
pub fn cacher_map() -> CacheMap {
    CacheMap::builder()
        .resource(
            ResourceConfig::new("Cacher")
                .collection(
                    CollectionConfig::new("joins", "Join", Relation::direct("cacher_id"))
                        .member("dependent_cache"),
                )
                .collection(CollectionConfig::new(
                    "polymorphics",
                    "Polymorphic",
                    Relation::ManyToMany,
                ))
                .collection(CollectionConfig::new(
                    "hmt_polymorphics",
                    "Polymorphic",
                    Relation::through("Join", "cacher_id", "polymorphic_id"),
                ))
                .collection(CollectionConfig::new(
                    "child_cachers",
                    "Cacher",
                    Relation::direct("parent_id"),
                ))
                .chain("dependent_cache", ["very_dependent_cache"]),
        )
        .resource(ResourceConfig::new("Join"))
        .resource(ResourceConfig::new("Polymorphic"))
        .build()
        .expect("valid cache map")
}
