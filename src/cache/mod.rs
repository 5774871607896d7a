//! Dependency-aware cache engine.
//!
//! - **Keys**: deterministic keys for content, association maps and
//!   timestamp tokens
//! - **Association maps**: cached forward and reverse id sets per collection
//! - **Timestamps**: lazily created version tokens
//! - **Dependency graph**: which owner members a changed record invalidates
//! - **Façade**: [`CacheMachine`] fetch, delete and lifecycle entry points
//!
//! ## Configuration
//!
//! Runtime knobs live in the `[cache]` table of `cache_machine.toml`:
//!
//! ```toml
//! [cache]
//! formats = ["ehtml", "json", "xml"]
//! max_probe_pages = 1024
//! enabled = true
//! ```
//!
//! The dependency declarations themselves are code, see [`CacheMap`].

mod adapter;
mod associations;
mod config;
mod events;
mod invalidator;
pub mod keys;
mod lock;
mod machine;
mod map;
mod memory;
mod planner;
#[cfg(feature = "redis")]
mod redis_adapter;
mod registry;
mod resource;
mod timestamps;

pub use adapter::{Adapters, BackendError, StorageAdapter};
pub use associations::AssociationMaps;
pub use config::CacheConfig;
pub use events::{ChangedRecord, EventBus, EventCallback, LifecycleEvent, LifecycleHooks};
pub use invalidator::{InvalidationReport, Invalidator};
pub use keys::TimestampScope;
pub use machine::{CacheMachine, ExpiresAt, FetchOptions};
pub use map::{
    CacheMap, CacheMapBuilder, CollectionConfig, InvalidationStyle, MemberConfig, MemberSpec,
    Relation, ResourceConfig, ResourceSpec, TimestampFn,
};
pub use memory::MemoryAdapter;
pub use planner::{InvalidationPlan, MapLink};
#[cfg(feature = "redis")]
pub use redis_adapter::RedisAdapter;
pub use registry::{Dependent, DependencyGraph, Registration, Role};
pub use resource::{RecordSource, Resource, ResourceId, ResourceRef};
pub use timestamps::TimestampRegistry;
