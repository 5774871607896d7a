//! Static cache map.
//!
//! Declares, per resource type, which collections and members are cached and
//! how they depend on each other. Built once at startup and shared
//! read-only; nothing is discovered from the record layer at runtime.
//!
//! ```
//! use cache_machine::{CacheMap, CollectionConfig, Relation, ResourceConfig};
//!
//! let map = CacheMap::builder()
//!     .resource(
//!         ResourceConfig::new("Cacher")
//!             .collection(
//!                 CollectionConfig::new("joins", "Join", Relation::direct("cacher_id"))
//!                     .member("dependent_cache"),
//!             )
//!             .chain("dependent_cache", ["summary"]),
//!     )
//!     .build()
//!     .expect("valid cache map");
//!
//! assert!(map.dependents_of("Cacher", "joins").any(|m| m == "dependent_cache"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::CacheError;

use super::events::LifecycleEvent;
use super::registry::{DependencyGraph, Registration};
use super::resource::ResourceRef;

/// Produces an extra versioning component for a resource's keys.
pub type TimestampFn = Arc<dyn Fn(&ResourceRef) -> String + Send + Sync>;

/// How a member is invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidationStyle {
    /// Delete every format/page variant of the content key.
    #[default]
    Delete,
    /// Leave content in place and advance the member's timestamp token.
    Timestamp,
}

/// How the related type of a collection points back at its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// The related record carries the owner's id in `foreign_key`.
    Direct { foreign_key: String },
    /// Owners and related records are linked without a modelled join record.
    ManyToMany,
    /// Links are `join_type` records holding both ids.
    Through {
        join_type: String,
        owner_key: String,
        related_key: String,
    },
}

impl Relation {
    pub fn direct(foreign_key: impl Into<String>) -> Self {
        Self::Direct {
            foreign_key: foreign_key.into(),
        }
    }

    pub fn through(
        join_type: impl Into<String>,
        owner_key: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        Self::Through {
            join_type: join_type.into(),
            owner_key: owner_key.into(),
            related_key: related_key.into(),
        }
    }
}

/// Per-member options.
#[derive(Clone, Default)]
pub struct MemberConfig {
    style: Option<InvalidationStyle>,
    formats: Vec<String>,
    expires_in: Option<Duration>,
    timestamp: Option<TimestampFn>,
}

impl MemberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn style(mut self, style: InvalidationStyle) -> Self {
        self.style = Some(style);
        self
    }

    /// Extra formats probed when this member is deleted.
    pub fn formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats.extend(formats.into_iter().map(Into::into));
        self
    }

    /// TTL used when a fetch names no expiry of its own.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    /// Versions every key of this member with the callback's output.
    pub fn timestamp(mut self, callback: impl Fn(&ResourceRef) -> String + Send + Sync + 'static) -> Self {
        self.timestamp = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for MemberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberConfig")
            .field("style", &self.style)
            .field("formats", &self.formats)
            .field("expires_in", &self.expires_in)
            .field("timestamp", &self.timestamp.is_some())
            .finish()
    }
}

/// A cached to-many association and the members its changes invalidate.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    name: String,
    related_type: String,
    relation: Relation,
    own: MemberConfig,
    members: Vec<(String, MemberConfig)>,
    on: Option<Vec<LifecycleEvent>>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, related_type: impl Into<String>, relation: Relation) -> Self {
        Self {
            name: name.into(),
            related_type: related_type.into(),
            relation,
            own: MemberConfig::default(),
            members: Vec::new(),
            on: None,
        }
    }

    /// A member invalidated together with the collection.
    pub fn member(self, name: impl Into<String>) -> Self {
        self.member_with(name, MemberConfig::default())
    }

    pub fn member_with(mut self, name: impl Into<String>, config: MemberConfig) -> Self {
        self.members.push((name.into(), config));
        self
    }

    /// Lifecycle events of the related type that trigger invalidation.
    pub fn on(mut self, events: impl IntoIterator<Item = LifecycleEvent>) -> Self {
        self.on = Some(events.into_iter().collect());
        self
    }

    /// Extra formats probed for the collection and its members.
    pub fn formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.own = self.own.formats(formats);
        self
    }

    /// Options for the collection's own cache slot.
    pub fn configure(mut self, config: MemberConfig) -> Self {
        let formats = std::mem::take(&mut self.own.formats);
        self.own = config;
        self.own.formats.extend(formats);
        self
    }
}

/// Cache declarations for one resource type.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    resource_type: String,
    class_timestamp: bool,
    style: InvalidationStyle,
    collections: Vec<CollectionConfig>,
    members: Vec<(String, MemberConfig)>,
    chains: Vec<(String, Vec<String>)>,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            class_timestamp: true,
            style: InvalidationStyle::default(),
            collections: Vec::new(),
            members: Vec::new(),
            chains: Vec::new(),
        }
    }

    /// Whether the type carries a class-wide timestamp reset on its own
    /// saves and destroys.
    pub fn class_timestamp(mut self, enabled: bool) -> Self {
        self.class_timestamp = enabled;
        self
    }

    /// Default style for members that do not set one.
    pub fn style(mut self, style: InvalidationStyle) -> Self {
        self.style = style;
        self
    }

    pub fn collection(mut self, collection: CollectionConfig) -> Self {
        self.collections.push(collection);
        self
    }

    /// A cache slot not backed by an association.
    pub fn member(mut self, name: impl Into<String>, config: MemberConfig) -> Self {
        self.members.push((name.into(), config));
        self
    }

    /// Invalidating `member` also invalidates every member in `dependents`.
    pub fn chain<I, S>(mut self, member: impl Into<String>, dependents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chains
            .push((member.into(), dependents.into_iter().map(Into::into).collect()));
        self
    }
}

/// Resolved options of one member.
#[derive(Clone)]
pub struct MemberSpec {
    pub style: InvalidationStyle,
    pub formats: BTreeSet<String>,
    pub expires_in: Option<Duration>,
    pub timestamp: Option<TimestampFn>,
}

impl MemberSpec {
    fn resolve(config: MemberConfig, default_style: InvalidationStyle) -> Self {
        Self {
            style: config.style.unwrap_or(default_style),
            formats: config.formats.into_iter().collect(),
            expires_in: config.expires_in,
            timestamp: config.timestamp,
        }
    }
}

impl fmt::Debug for MemberSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberSpec")
            .field("style", &self.style)
            .field("formats", &self.formats)
            .field("expires_in", &self.expires_in)
            .field("timestamp", &self.timestamp.is_some())
            .finish()
    }
}

/// Resolved declarations of one resource type.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    resource_type: String,
    class_timestamp: bool,
    style: InvalidationStyle,
    members: BTreeMap<String, MemberSpec>,
    collections: BTreeSet<String>,
    chains: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceSpec {
    fn new(resource_type: String, class_timestamp: bool, style: InvalidationStyle) -> Self {
        Self {
            resource_type,
            class_timestamp,
            style,
            members: BTreeMap::new(),
            collections: BTreeSet::new(),
            chains: BTreeMap::new(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn has_class_timestamp(&self) -> bool {
        self.class_timestamp
    }

    pub fn default_style(&self) -> InvalidationStyle {
        self.style
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &MemberSpec)> {
        self.members.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    fn add_member(&mut self, name: String, spec: MemberSpec) {
        if self.members.contains_key(&name) {
            debug!(
                resource_type = %self.resource_type,
                member = %name,
                "duplicate member declaration ignored"
            );
            return;
        }
        self.members.insert(name, spec);
    }

    fn add_chain(&mut self, member: &str, dependents: impl IntoIterator<Item = String>) {
        let entry = self.chains.entry(member.to_string()).or_default();
        for dependent in dependents {
            if dependent != member {
                entry.insert(dependent);
            }
        }
    }
}

/// Immutable cache declarations for every resource type.
#[derive(Debug, Clone, Default)]
pub struct CacheMap {
    resources: BTreeMap<String, ResourceSpec>,
    graph: DependencyGraph,
}

impl CacheMap {
    pub fn builder() -> CacheMapBuilder {
        CacheMapBuilder::default()
    }

    pub fn resource(&self, resource_type: &str) -> Option<&ResourceSpec> {
        self.resources.get(resource_type)
    }

    pub fn member(&self, resource_type: &str, member: &str) -> Option<&MemberSpec> {
        self.resources.get(resource_type)?.members.get(member)
    }

    /// Style for `member`, falling back to the resource default, then to
    /// [`InvalidationStyle::Delete`].
    pub fn style_of(&self, resource_type: &str, member: &str) -> InvalidationStyle {
        match self.resources.get(resource_type) {
            Some(resource) => resource
                .members
                .get(member)
                .map_or(resource.style, |spec| spec.style),
            None => InvalidationStyle::default(),
        }
    }

    /// Members invalidated whenever `member` is, one level deep.
    pub fn dependents_of<'a>(
        &'a self,
        resource_type: &str,
        member: &str,
    ) -> impl Iterator<Item = &'a str> + use<'a> {
        self.resources
            .get(resource_type)
            .and_then(|resource| resource.chains.get(member))
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Every declared member of `resource_type`, collections included.
    pub fn members_of(&self, resource_type: &str) -> Vec<&str> {
        let Some(resource) = self.resources.get(resource_type) else {
            return Vec::new();
        };
        let mut members: BTreeSet<&str> = resource.members.keys().map(String::as_str).collect();
        for (member, dependents) in &resource.chains {
            members.insert(member);
            members.extend(dependents.iter().map(String::as_str));
        }
        members.into_iter().collect()
    }

    pub fn has_class_timestamp(&self, resource_type: &str) -> bool {
        self.resources
            .get(resource_type)
            .is_some_and(ResourceSpec::has_class_timestamp)
    }

    /// Types whose class timestamp is maintained.
    pub fn class_timestamp_types(&self) -> impl Iterator<Item = &str> {
        self.resources
            .values()
            .filter(|resource| resource.class_timestamp)
            .map(ResourceSpec::resource_type)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

#[derive(Debug, Default)]
pub struct CacheMapBuilder {
    resources: Vec<ResourceConfig>,
}

impl CacheMapBuilder {
    pub fn resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn build(self) -> Result<CacheMap, CacheError> {
        let mut map = CacheMap::default();
        for resource in self.resources {
            add_resource(&mut map, resource)?;
        }
        Ok(map)
    }
}

fn add_resource(map: &mut CacheMap, config: ResourceConfig) -> Result<(), CacheError> {
    let ResourceConfig {
        resource_type,
        class_timestamp,
        style,
        collections,
        members,
        chains,
    } = config;
    require_name("resource type", &resource_type)?;

    let spec = map
        .resources
        .entry(resource_type.clone())
        .or_insert_with(|| ResourceSpec::new(resource_type.clone(), class_timestamp, style));

    for collection in collections {
        add_collection(spec, &mut map.graph, collection)?;
    }

    for (name, member) in members {
        require_name("member", &name)?;
        let resolved = MemberSpec::resolve(member, spec.style);
        spec.add_member(name, resolved);
    }

    for (member, dependents) in chains {
        require_name("member", &member)?;
        for dependent in &dependents {
            require_name("chained member", dependent)?;
        }
        spec.add_chain(&member, dependents);
    }
    Ok(())
}

fn add_collection(
    spec: &mut ResourceSpec,
    graph: &mut DependencyGraph,
    config: CollectionConfig,
) -> Result<(), CacheError> {
    let CollectionConfig {
        name,
        related_type,
        relation,
        own,
        members,
        on,
    } = config;
    require_name("collection", &name)?;
    require_name("related type", &related_type)?;
    validate_relation(&relation)?;
    for (member, _) in &members {
        require_name("member", member)?;
    }

    if spec.collections.contains(&name) {
        debug!(
            owner_type = %spec.resource_type,
            collection = %name,
            "duplicate collection registration ignored"
        );
        return Ok(());
    }

    let collection_formats = own.formats.clone();
    let mut invalidates = BTreeSet::from([name.clone()]);
    for (member, config) in members {
        let mut resolved = MemberSpec::resolve(config, spec.style);
        resolved.formats.extend(collection_formats.iter().cloned());
        invalidates.insert(member.clone());
        spec.add_chain(&name, [member.clone()]);
        spec.add_member(member, resolved);
    }
    spec.add_member(name.clone(), MemberSpec::resolve(own, spec.style));
    spec.collections.insert(name.clone());

    let on = on
        .unwrap_or_else(|| LifecycleEvent::DEFAULT_TRIGGERS.to_vec())
        .into_iter()
        .collect();
    graph.register(Registration {
        owner_type: spec.resource_type.clone(),
        collection: name,
        related_type,
        relation,
        members: invalidates,
        on,
    });
    Ok(())
}

fn validate_relation(relation: &Relation) -> Result<(), CacheError> {
    match relation {
        Relation::Direct { foreign_key } => require_name("foreign key", foreign_key),
        Relation::ManyToMany => Ok(()),
        Relation::Through {
            join_type,
            owner_key,
            related_key,
        } => {
            require_name("join type", join_type)?;
            require_name("owner key", owner_key)?;
            require_name("related key", related_key)
        }
    }
}

fn require_name(what: &str, value: &str) -> Result<(), CacheError> {
    if value.trim().is_empty() {
        return Err(CacheError::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cacher() -> ResourceConfig {
        ResourceConfig::new("Cacher")
            .collection(
                CollectionConfig::new("joins", "Join", Relation::direct("cacher_id"))
                    .member("dependent_cache")
                    .formats(["csv"]),
            )
            .collection(CollectionConfig::new(
                "polymorphics",
                "Polymorphic",
                Relation::ManyToMany,
            ))
            .member(
                "stamped",
                MemberConfig::new().style(InvalidationStyle::Timestamp),
            )
    }

    #[test]
    fn collection_members_join_the_chain() {
        let map = CacheMap::builder()
            .resource(cacher())
            .build()
            .expect("valid map");

        let dependents: Vec<_> = map.dependents_of("Cacher", "joins").collect();
        assert_eq!(dependents, vec!["dependent_cache"]);
        assert_eq!(
            map.members_of("Cacher"),
            vec!["dependent_cache", "joins", "polymorphics", "stamped"]
        );
    }

    #[test]
    fn collection_formats_reach_members() {
        let map = CacheMap::builder()
            .resource(cacher())
            .build()
            .expect("valid map");

        let member = map
            .member("Cacher", "dependent_cache")
            .expect("member declared");
        assert!(member.formats.contains("csv"));
        assert!(map.member("Cacher", "joins").expect("collection").formats.contains("csv"));
    }

    #[test]
    fn style_falls_back_to_resource_default() {
        let map = CacheMap::builder()
            .resource(cacher())
            .resource(ResourceConfig::new("Versioned").style(InvalidationStyle::Timestamp))
            .build()
            .expect("valid map");

        assert_eq!(map.style_of("Cacher", "joins"), InvalidationStyle::Delete);
        assert_eq!(map.style_of("Cacher", "stamped"), InvalidationStyle::Timestamp);
        assert_eq!(map.style_of("Versioned", "anything"), InvalidationStyle::Timestamp);
        assert_eq!(map.style_of("Unknown", "anything"), InvalidationStyle::Delete);
    }

    #[test]
    fn duplicate_collection_keeps_first_registration() {
        let map = CacheMap::builder()
            .resource(cacher())
            .resource(ResourceConfig::new("Cacher").collection(
                CollectionConfig::new("joins", "Other", Relation::ManyToMany).member("late"),
            ))
            .build()
            .expect("valid map");

        let registration = map
            .graph()
            .registration("Cacher", "joins")
            .expect("registered");
        assert_eq!(registration.related_type, "Join");
        assert!(map.member("Cacher", "late").is_none());
    }

    #[test]
    fn chains_ignore_self_references() {
        let map = CacheMap::builder()
            .resource(ResourceConfig::new("A").chain("x", ["x", "y"]))
            .build()
            .expect("valid map");
        assert_eq!(map.dependents_of("A", "x").collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn empty_names_are_rejected() {
        let err = CacheMap::builder()
            .resource(ResourceConfig::new("A").collection(CollectionConfig::new(
                "items",
                "B",
                Relation::through("", "a_id", "b_id"),
            )))
            .build()
            .expect_err("empty join type");
        assert!(matches!(err, CacheError::Validation { .. }));

        assert!(CacheMap::builder().resource(ResourceConfig::new("")).build().is_err());
    }

    #[test]
    fn class_timestamps_default_on() {
        let map = CacheMap::builder()
            .resource(cacher())
            .resource(ResourceConfig::new("Plain").class_timestamp(false))
            .build()
            .expect("valid map");

        assert!(map.has_class_timestamp("Cacher"));
        assert!(!map.has_class_timestamp("Plain"));
        assert_eq!(map.class_timestamp_types().collect::<Vec<_>>(), vec!["Cacher"]);
    }
}
