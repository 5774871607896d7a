//! Invalidation plan generation.
//!
//! Turns one lifecycle event into the set of owner members to invalidate,
//! the association links to record and the class timestamps to reset.
//! Targets are merged so each `(owner, member)` appears once per event.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::error::CacheError;

use super::associations::AssociationMaps;
use super::events::{ChangedRecord, LifecycleEvent};
use super::map::{CacheMap, Relation};
use super::registry::{Registration, Role};
use super::resource::{ResourceId, ResourceRef};

/// One association link discovered while planning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MapLink {
    pub owner: ResourceRef,
    pub collection: String,
    pub related: ResourceRef,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Members to invalidate, per owner.
    pub targets: BTreeMap<ResourceRef, BTreeSet<String>>,
    /// Links to append to the forward and reverse maps.
    pub links: BTreeSet<MapLink>,
    /// Resource types whose class timestamp is reset.
    pub class_timestamps: BTreeSet<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ owners: {}, members: {}, links: {}, class_timestamps: {} }}",
            self.targets.len(),
            self.member_count(),
            self.links.len(),
            self.class_timestamps.len(),
        )
    }
}

impl InvalidationPlan {
    /// Plans the work for `event` on `record`.
    ///
    /// Many-to-many owners come from the reverse map, which is rebuilt with
    /// a single record-source query when cold.
    pub fn for_event(
        map: &CacheMap,
        associations: &AssociationMaps,
        event: LifecycleEvent,
        record: &ChangedRecord,
    ) -> Result<Self, CacheError> {
        let mut plan = Self::default();
        let changed_type = record.resource.resource_type();

        if map.has_class_timestamp(changed_type)
            && matches!(event, LifecycleEvent::AfterSave | LifecycleEvent::AfterDestroy)
        {
            plan.class_timestamps.insert(changed_type.to_string());
        }

        for dependent in map.graph().dependents(changed_type, event) {
            let registration = dependent.registration;
            match (&registration.relation, dependent.role) {
                (Relation::Direct { foreign_key }, Role::Related) => {
                    plan.add_direct(registration, event, record, foreign_key);
                }
                (Relation::ManyToMany | Relation::Through { .. }, Role::Related) => {
                    let owners = associations.reverse_association_ids(
                        &registration.owner_type,
                        &registration.collection,
                        &record.resource,
                    )?;
                    if owners.is_empty() {
                        debug!(
                            owner_type = %registration.owner_type,
                            collection = %registration.collection,
                            related = %record.resource,
                            "no linked owners"
                        );
                    }
                    for owner_id in owners {
                        plan.invalidate(
                            ResourceRef::new(registration.owner_type.as_str(), owner_id),
                            registration.members.iter().cloned(),
                        );
                    }
                }
                (
                    Relation::Through {
                        owner_key,
                        related_key,
                        ..
                    },
                    Role::Join,
                ) => {
                    plan.add_join(registration, event, record, owner_key, related_key);
                }
                (Relation::Direct { .. } | Relation::ManyToMany, Role::Join) => {}
            }
        }

        Ok(plan)
    }

    /// Plans a link edit on `owner.collection` that did not save `related`.
    pub fn for_link_change(
        map: &CacheMap,
        owner: &ResourceRef,
        collection: &str,
        related: &ResourceRef,
        linked: bool,
    ) -> Self {
        let mut plan = Self::default();
        let members: BTreeSet<String> = map
            .graph()
            .registration(owner.resource_type(), collection)
            .map(|registration| registration.members.clone())
            .unwrap_or_else(|| BTreeSet::from([collection.to_string()]));
        plan.invalidate(owner.clone(), members);
        if linked {
            plan.link(owner.clone(), collection, related.clone());
        }
        plan
    }

    pub fn invalidate(&mut self, owner: ResourceRef, members: impl IntoIterator<Item = String>) {
        self.targets.entry(owner).or_default().extend(members);
    }

    pub fn link(&mut self, owner: ResourceRef, collection: &str, related: ResourceRef) {
        self.links.insert(MapLink {
            owner,
            collection: collection.to_string(),
            related,
        });
    }

    pub fn member_count(&self) -> usize {
        self.targets.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.links.is_empty() && self.class_timestamps.is_empty()
    }

    fn add_direct(
        &mut self,
        registration: &Registration,
        event: LifecycleEvent,
        record: &ChangedRecord,
        foreign_key: &str,
    ) {
        let current = record.foreign_key(foreign_key);
        if current.is_none() && record.moved_from(foreign_key).is_none() {
            debug!(
                related = %record.resource,
                foreign_key,
                "changed record carries no owner key"
            );
            return;
        }

        for owner_id in owner_ids(record, foreign_key) {
            self.invalidate(
                ResourceRef::new(registration.owner_type.as_str(), owner_id),
                registration.members.iter().cloned(),
            );
        }
        if event == LifecycleEvent::AfterSave
            && let Some(owner_id) = current
        {
            self.link(
                ResourceRef::new(registration.owner_type.as_str(), owner_id.clone()),
                &registration.collection,
                record.resource.clone(),
            );
        }
    }

    fn add_join(
        &mut self,
        registration: &Registration,
        event: LifecycleEvent,
        record: &ChangedRecord,
        owner_key: &str,
        related_key: &str,
    ) {
        for owner_id in owner_ids(record, owner_key) {
            self.invalidate(
                ResourceRef::new(registration.owner_type.as_str(), owner_id),
                registration.members.iter().cloned(),
            );
        }
        if event == LifecycleEvent::AfterSave
            && let Some(owner_id) = record.foreign_key(owner_key)
            && let Some(related_id) = record.foreign_key(related_key)
        {
            self.link(
                ResourceRef::new(registration.owner_type.as_str(), owner_id.clone()),
                &registration.collection,
                ResourceRef::new(registration.related_type.as_str(), related_id.clone()),
            );
        }
    }
}

/// Current owner id plus the previous one when the record moved.
fn owner_ids(record: &ChangedRecord, column: &str) -> Vec<ResourceId> {
    record
        .foreign_key(column)
        .into_iter()
        .chain(record.moved_from(column))
        .cloned()
        .collect()
}
