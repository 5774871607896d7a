//! Cache façade.
//!
//! [`CacheMachine`] composes keys, timestamps, association maps and the
//! invalidator behind one cheaply cloneable handle.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::error::CacheError;

use super::adapter::{Adapters, StorageAdapter};
use super::associations::AssociationMaps;
use super::config::CacheConfig;
use super::events::{ChangedRecord, EventCallback, LifecycleEvent, LifecycleHooks};
use super::invalidator::{InvalidationReport, Invalidator};
use super::keys::{self, TimestampScope};
use super::map::{CacheMap, InvalidationStyle, TimestampFn};
use super::planner::InvalidationPlan;
use super::resource::{RecordSource, Resource, ResourceId, ResourceRef};
use super::timestamps::TimestampRegistry;

const METRIC_FETCH_HIT: &str = "cache_machine_fetch_hit_total";
const METRIC_FETCH_MISS: &str = "cache_machine_fetch_miss_total";
const METRIC_FETCH_BYPASS: &str = "cache_machine_fetch_bypass_total";

/// Absolute expiry, fixed or derived from the resource.
#[derive(Clone)]
pub enum ExpiresAt {
    Fixed(OffsetDateTime),
    Computed(Arc<dyn Fn(&ResourceRef) -> OffsetDateTime + Send + Sync>),
}

impl ExpiresAt {
    fn resolve(&self, resource: &ResourceRef) -> OffsetDateTime {
        match self {
            Self::Fixed(at) => *at,
            Self::Computed(callback) => callback(resource),
        }
    }
}

impl fmt::Debug for ExpiresAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(at) => f.debug_tuple("Fixed").field(at).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Per-call options of [`CacheMachine::fetch_cache_of`].
#[derive(Clone, Default)]
pub struct FetchOptions {
    format: Option<String>,
    page: Option<u32>,
    expires_in: Option<Duration>,
    expires_at: Option<ExpiresAt>,
    timestamp: Option<TimestampFn>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn expires_at(mut self, at: OffsetDateTime) -> Self {
        self.expires_at = Some(ExpiresAt::Fixed(at));
        self
    }

    pub fn expires_at_with(
        mut self,
        callback: impl Fn(&ResourceRef) -> OffsetDateTime + Send + Sync + 'static,
    ) -> Self {
        self.expires_at = Some(ExpiresAt::Computed(Arc::new(callback)));
        self
    }

    /// Appends the callback's output to the key, versioned by the member's
    /// timestamp token.
    pub fn timestamp(
        mut self,
        callback: impl Fn(&ResourceRef) -> String + Send + Sync + 'static,
    ) -> Self {
        self.timestamp = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("format", &self.format)
            .field("page", &self.page)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("timestamp", &self.timestamp.is_some())
            .finish()
    }
}

/// How long a freshly computed value may live.
enum Lifetime {
    Cache(Option<Duration>),
    /// The absolute expiry already passed; compute without caching.
    Bypass,
}

struct Inner {
    config: CacheConfig,
    map: Arc<CacheMap>,
    storage: Arc<dyn StorageAdapter>,
    timestamps: Arc<TimestampRegistry>,
    associations: Arc<AssociationMaps>,
    invalidator: Invalidator,
    bound: AtomicBool,
}

/// Dependency-aware cache handle.
#[derive(Clone)]
pub struct CacheMachine {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMachine")
            .field("config", &self.inner.config)
            .field("registrations", &self.inner.map.graph().len())
            .field("bound", &self.inner.bound.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CacheMachine {
    pub fn new(
        config: CacheConfig,
        map: CacheMap,
        adapters: Adapters,
        records: Arc<dyn RecordSource>,
    ) -> Self {
        let map = Arc::new(map);
        let timestamps = Arc::new(TimestampRegistry::new(adapters.timestamps));
        let associations = Arc::new(AssociationMaps::new(adapters.maps, records));
        let invalidator = Invalidator::new(
            config.clone(),
            Arc::clone(&map),
            Arc::clone(&adapters.storage),
            Arc::clone(&timestamps),
            Arc::clone(&associations),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                map,
                storage: adapters.storage,
                timestamps,
                associations,
                invalidator,
                bound: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn cache_map(&self) -> &CacheMap {
        &self.inner.map
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Returns the cached value of `member`, computing and storing it on a
    /// miss. `compute` runs at most once and never on a hit.
    ///
    /// Concurrent misses converge on whichever value the backend stored
    /// first; every caller gets that value back.
    #[instrument(skip_all, fields(resource = %resource.resource_ref(), member = %member))]
    pub fn fetch_cache_of<T, F>(
        &self,
        resource: &impl Resource,
        member: &str,
        options: &FetchOptions,
        compute: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, CacheError>,
    {
        self.fetch_with(
            &resource.resource_ref(),
            member,
            options,
            compute,
            |value| Ok(Bytes::from(serde_json::to_vec(value)?)),
            |raw| Ok(serde_json::from_slice(raw)?),
        )
    }

    /// Like [`fetch_cache_of`](Self::fetch_cache_of) for opaque bytes.
    #[instrument(skip_all, fields(resource = %resource.resource_ref(), member = %member))]
    pub fn fetch_raw<F>(
        &self,
        resource: &impl Resource,
        member: &str,
        options: &FetchOptions,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Result<Bytes, CacheError>,
    {
        self.fetch_with(
            &resource.resource_ref(),
            member,
            options,
            compute,
            |value| Ok(value.clone()),
            |raw| Ok(raw.clone()),
        )
    }

    fn fetch_with<T, C, E, D>(
        &self,
        resource: &ResourceRef,
        member: &str,
        options: &FetchOptions,
        compute: C,
        encode: E,
        decode: D,
    ) -> Result<T, CacheError>
    where
        C: FnOnce() -> Result<T, CacheError>,
        E: FnOnce(&T) -> Result<Bytes, CacheError>,
        D: Fn(&Bytes) -> Result<T, CacheError>,
    {
        if !self.inner.config.enabled {
            return compute();
        }

        let ttl = match self.lifetime(resource, member, options)? {
            Lifetime::Cache(ttl) => ttl,
            Lifetime::Bypass => {
                counter!(METRIC_FETCH_BYPASS).increment(1);
                debug!(resource = %resource, member, "expiry already passed; computing uncached");
                return compute();
            }
        };

        let key = self.fetch_key(resource, member, options)?;
        let storage = &self.inner.storage;
        let mut overwrite = false;
        if let Some(raw) = storage.get(&key)? {
            match decode(&raw) {
                Ok(value) => {
                    counter!(METRIC_FETCH_HIT).increment(1);
                    debug!(key, outcome = "hit", "cache fetch");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(key, error = %err, "cached value no longer decodes; recomputing");
                    overwrite = true;
                }
            }
        }

        counter!(METRIC_FETCH_MISS).increment(1);
        debug!(key, outcome = "miss", "cache fetch");
        let value = compute()?;
        let encoded = encode(&value)?;

        if overwrite {
            storage.set(&key, encoded, ttl)?;
            return Ok(value);
        }

        let stored = storage.set_if_absent(&key, encoded.clone(), ttl)?;
        if stored == encoded {
            return Ok(value);
        }
        match decode(&stored) {
            Ok(winner) => Ok(winner),
            Err(err) => {
                warn!(key, error = %err, "concurrent value does not decode; overwriting");
                storage.set(&key, encoded, ttl)?;
                Ok(value)
            }
        }
    }

    fn lifetime(
        &self,
        resource: &ResourceRef,
        member: &str,
        options: &FetchOptions,
    ) -> Result<Lifetime, CacheError> {
        match (&options.expires_in, &options.expires_at) {
            (Some(_), Some(_)) => Err(CacheError::validation(
                "expires_in and expires_at are mutually exclusive",
            )),
            (Some(ttl), None) => Ok(Lifetime::Cache(Some(*ttl))),
            (None, Some(at)) => {
                let remaining = at.resolve(resource) - OffsetDateTime::now_utc();
                if !remaining.is_positive() {
                    return Ok(Lifetime::Bypass);
                }
                let ttl = Duration::try_from(remaining).map_err(|err| {
                    CacheError::validation(format!("expires_at out of range: {err}"))
                })?;
                Ok(Lifetime::Cache(Some(ttl)))
            }
            (None, None) => Ok(Lifetime::Cache(
                self.inner
                    .map
                    .member(resource.resource_type(), member)
                    .and_then(|spec| spec.expires_in)
                    .or_else(|| self.inner.config.default_ttl()),
            )),
        }
    }

    fn fetch_key(
        &self,
        resource: &ResourceRef,
        member: &str,
        options: &FetchOptions,
    ) -> Result<String, CacheError> {
        let callback = options.timestamp.clone().or_else(|| {
            self.inner
                .map
                .member(resource.resource_type(), member)
                .and_then(|spec| spec.timestamp.clone())
        });
        let extra = callback.map(|callback| callback(resource));
        self.versioned_content_key(
            resource,
            member,
            options.format.as_deref(),
            options.page,
            extra.as_deref(),
        )
    }

    /// Timestamp-style members and callback-versioned keys carry the
    /// member's instance token; everything else uses the bare content key.
    fn versioned_content_key(
        &self,
        resource: &ResourceRef,
        member: &str,
        format: Option<&str>,
        page: Option<u32>,
        extra: Option<&str>,
    ) -> Result<String, CacheError> {
        let base = keys::content_key(resource, member, format, page)?;
        let style = self.inner.map.style_of(resource.resource_type(), member);
        if style == InvalidationStyle::Timestamp || extra.is_some() {
            let scope = TimestampScope::Instance(resource.clone());
            return self.inner.timestamps.versioned_key(&base, &scope, member, extra);
        }
        Ok(base)
    }

    /// Key [`fetch_cache_of`](Self::fetch_cache_of) would use without a
    /// per-call timestamp callback.
    pub fn cache_key_of(
        &self,
        resource: &impl Resource,
        member: &str,
        format: Option<&str>,
        page: Option<u32>,
    ) -> Result<String, CacheError> {
        let resource = resource.resource_ref();
        let extra = self
            .inner
            .map
            .member(resource.resource_type(), member)
            .and_then(|spec| spec.timestamp.as_ref())
            .map(|callback| callback(&resource));
        self.versioned_content_key(&resource, member, format, page, extra.as_deref())
    }

    // ------------------------------------------------------------------
    // Explicit invalidation
    // ------------------------------------------------------------------

    /// Invalidates `member` and every member chained after it. Returns the
    /// number of content keys deleted.
    #[instrument(skip_all, fields(resource = %resource.resource_ref(), member = %member))]
    pub fn delete_cache_of(&self, resource: &impl Resource, member: &str) -> Result<usize, CacheError> {
        if !self.inner.config.enabled {
            return Ok(0);
        }
        let report = self.inner.invalidator.invalidate(&resource.resource_ref(), member)?;
        Ok(report.keys_deleted)
    }

    /// Invalidates `member` without cascading.
    pub fn delete_cache_of_only(
        &self,
        resource: &impl Resource,
        member: &str,
    ) -> Result<usize, CacheError> {
        if !self.inner.config.enabled {
            return Ok(0);
        }
        let report = self
            .inner
            .invalidator
            .invalidate_only(&resource.resource_ref(), member)?;
        Ok(report.keys_deleted)
    }

    /// Invalidates every member declared for the resource's type.
    #[instrument(skip_all, fields(resource = %resource.resource_ref()))]
    pub fn delete_all_caches(&self, resource: &impl Resource) -> Result<usize, CacheError> {
        if !self.inner.config.enabled {
            return Ok(0);
        }
        let report = self.inner.invalidator.invalidate_all(&resource.resource_ref())?;
        Ok(report.keys_deleted)
    }

    // ------------------------------------------------------------------
    // Timestamps
    // ------------------------------------------------------------------

    pub fn timestamp_of(&self, resource: &impl Resource, member: &str) -> Result<String, CacheError> {
        self.inner
            .timestamps
            .get_or_create(&instance_scope(resource), member)
    }

    pub fn timestamp_key_of(&self, resource: &impl Resource, member: &str) -> Result<String, CacheError> {
        keys::timestamp_key(&instance_scope(resource), member)
    }

    /// Unformatted first-page key of `member` versioned by its token.
    pub fn timestamped_key_of(
        &self,
        resource: &impl Resource,
        member: &str,
    ) -> Result<String, CacheError> {
        let resource = resource.resource_ref();
        let base = keys::content_key(&resource, member, None, None)?;
        self.inner.timestamps.versioned_key(
            &base,
            &TimestampScope::Instance(resource),
            member,
            None,
        )
    }

    pub fn reset_timestamp_of(&self, resource: &impl Resource, member: &str) -> Result<bool, CacheError> {
        self.inner
            .timestamps
            .reset(&instance_scope(resource), member)
    }

    pub fn class_timestamp(&self, resource_type: &str, format: Option<&str>) -> Result<String, CacheError> {
        self.inner.timestamps.class_token(resource_type, format)
    }

    /// `base` versioned by the class token of `resource_type`.
    pub fn class_timestamped_key(
        &self,
        resource_type: &str,
        base: &str,
        format: Option<&str>,
    ) -> Result<String, CacheError> {
        let token = self.inner.timestamps.class_token(resource_type, format)?;
        Ok(keys::versioned_key(base, &token, None))
    }

    /// Resets the class token for the unformatted variant and every
    /// configured format.
    pub fn reset_class_timestamp(&self, resource_type: &str) -> Result<usize, CacheError> {
        self.inner.timestamps.reset_class(
            resource_type,
            self.inner.config.formats.iter().map(String::as_str),
        )
    }

    /// Token replaced whenever `stamp` differs from the last one seen.
    pub fn stamped_timestamp(
        &self,
        scope: &TimestampScope,
        name: &str,
        stamp: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, CacheError> {
        self.inner.timestamps.stamped(scope, name, stamp, expires_in)
    }

    // ------------------------------------------------------------------
    // Association maps
    // ------------------------------------------------------------------

    pub fn association_ids(
        &self,
        owner: &impl Resource,
        collection: &str,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        self.inner
            .associations
            .association_ids(&owner.resource_ref(), collection)
    }

    /// Alias of [`association_ids`](Self::association_ids).
    pub fn associated_ids(
        &self,
        owner: &impl Resource,
        collection: &str,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        self.association_ids(owner, collection)
    }

    pub fn reverse_association_ids(
        &self,
        owner_type: &str,
        collection: &str,
        related: &impl Resource,
    ) -> Result<BTreeSet<ResourceId>, CacheError> {
        self.inner
            .associations
            .reverse_association_ids(owner_type, collection, &related.resource_ref())
    }

    pub fn append_id_to_map(
        &self,
        owner: &impl Resource,
        collection: &str,
        id: &ResourceId,
    ) -> Result<(), CacheError> {
        self.inner
            .associations
            .append_id_to_map(&owner.resource_ref(), collection, id)
    }

    pub fn append_id_to_reverse_map(
        &self,
        owner_type: &str,
        collection: &str,
        related: &impl Resource,
        owner_id: &ResourceId,
    ) -> Result<(), CacheError> {
        self.inner.associations.append_id_to_reverse_map(
            owner_type,
            collection,
            &related.resource_ref(),
            owner_id,
        )
    }

    /// Fills forward and reverse maps of every collection owned by
    /// `resource_type`. Returns the number of links seen.
    #[instrument(skip(self))]
    pub fn warm_associations(&self, resource_type: &str) -> Result<usize, CacheError> {
        let mut links = 0;
        for registration in self.inner.map.graph().owned_by(resource_type) {
            links += self.inner.associations.warm(
                resource_type,
                &registration.collection,
                &registration.related_type,
            )?;
        }
        info!(resource_type, links, "Association maps warmed");
        Ok(links)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Subscribes to every lifecycle event the cache map depends on. Calls
    /// after the first are no-ops.
    pub fn bind(&self, hooks: &dyn LifecycleHooks) {
        if self.inner.bound.swap(true, Ordering::AcqRel) {
            debug!("cache machine already bound");
            return;
        }

        let map = &self.inner.map;
        let mut triggers = map.graph().triggers();
        for resource_type in map.class_timestamp_types() {
            triggers.insert((resource_type.to_string(), LifecycleEvent::AfterSave));
            triggers.insert((resource_type.to_string(), LifecycleEvent::AfterDestroy));
        }

        for (resource_type, event) in &triggers {
            let machine: Weak<Inner> = Arc::downgrade(&self.inner);
            let event = *event;
            let callback: EventCallback = Arc::new(move |record: &ChangedRecord| {
                match machine.upgrade() {
                    Some(inner) => CacheMachine { inner }
                        .record_changed(event, record)
                        .map(|_| ()),
                    None => Ok(()),
                }
            });
            hooks.on_event(resource_type, event, callback);
        }
        info!(bindings = triggers.len(), "Cache machine bound to lifecycle hooks");
    }

    /// Reacts to `event` on `record`: invalidates dependent owner members,
    /// records new links and resets class timestamps.
    #[instrument(skip_all, fields(event = %event, resource = %record.resource))]
    pub fn record_changed(
        &self,
        event: LifecycleEvent,
        record: &ChangedRecord,
    ) -> Result<InvalidationReport, CacheError> {
        if !self.inner.config.enabled {
            return Ok(InvalidationReport::default());
        }
        let plan =
            InvalidationPlan::for_event(&self.inner.map, &self.inner.associations, event, record)?;
        if plan.is_empty() {
            return Ok(InvalidationReport::default());
        }
        self.inner.invalidator.execute(&plan, event.as_str())
    }

    /// Reports a link added to `owner.collection` without saving `related`.
    pub fn collection_linked(
        &self,
        owner: &impl Resource,
        collection: &str,
        related: &impl Resource,
    ) -> Result<InvalidationReport, CacheError> {
        self.link_changed(owner, collection, related, true)
    }

    /// Reports a link removed from `owner.collection` without destroying
    /// `related`.
    pub fn collection_unlinked(
        &self,
        owner: &impl Resource,
        collection: &str,
        related: &impl Resource,
    ) -> Result<InvalidationReport, CacheError> {
        self.link_changed(owner, collection, related, false)
    }

    fn link_changed(
        &self,
        owner: &impl Resource,
        collection: &str,
        related: &impl Resource,
        linked: bool,
    ) -> Result<InvalidationReport, CacheError> {
        if !self.inner.config.enabled {
            return Ok(InvalidationReport::default());
        }
        let plan = InvalidationPlan::for_link_change(
            &self.inner.map,
            &owner.resource_ref(),
            collection,
            &related.resource_ref(),
            linked,
        );
        let event = if linked { "link" } else { "unlink" };
        self.inner.invalidator.execute(&plan, event)
    }
}

fn instance_scope(resource: &impl Resource) -> TimestampScope {
    TimestampScope::Instance(resource.resource_ref())
}
