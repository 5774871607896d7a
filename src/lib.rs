//! Dependency-aware caching for record-backed resources.
//!
//! Cached members of a resource are invalidated automatically when records
//! they depend on are saved or destroyed. See [`CacheMachine`] for the entry
//! points and [`CacheMap`] for declaring dependencies.

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;

pub use cache::{
    Adapters, BackendError, CacheConfig, CacheMachine, CacheMap, ChangedRecord, CollectionConfig,
    EventBus, FetchOptions, InvalidationReport, InvalidationStyle, LifecycleEvent, LifecycleHooks,
    MemberConfig, MemoryAdapter, RecordSource, Relation, Resource, ResourceConfig, ResourceId,
    ResourceRef, StorageAdapter, TimestampScope,
};
pub use error::CacheError;
