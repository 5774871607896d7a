//! Dependency graph.
//!
//! Indexes collection registrations by the record type whose lifecycle
//! events trigger them, so a changed record finds every owner-side member
//! it may have staled without inspecting the record layer.

use std::collections::{BTreeMap, BTreeSet};

use super::events::LifecycleEvent;
use super::map::Relation;

/// `(owner_type, collection)` declares that changes to `related_type`
/// records invalidate `members` on the owners reachable through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub owner_type: String,
    pub collection: String,
    pub related_type: String,
    pub relation: Relation,
    /// Always contains `collection` itself.
    pub members: BTreeSet<String>,
    pub on: BTreeSet<LifecycleEvent>,
}

/// Which side of a registration a changed record is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// The record is a member of the collection.
    Related,
    /// The record is a join row of a `Through` relation.
    Join,
}

/// A registration reached from a changed record.
#[derive(Debug, Clone, Copy)]
pub struct Dependent<'a> {
    pub registration: &'a Registration,
    pub role: Role,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    registrations: Vec<Registration>,
    by_owner: BTreeMap<(String, String), usize>,
    by_trigger: BTreeMap<String, Vec<(usize, Role)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration. Returns false, leaving the graph untouched, when
    /// `(owner_type, collection)` is already registered.
    pub fn register(&mut self, registration: Registration) -> bool {
        let owner_key = (
            registration.owner_type.clone(),
            registration.collection.clone(),
        );
        if self.by_owner.contains_key(&owner_key) {
            return false;
        }

        let index = self.registrations.len();
        self.by_trigger
            .entry(registration.related_type.clone())
            .or_default()
            .push((index, Role::Related));
        if let Relation::Through { join_type, .. } = &registration.relation {
            self.by_trigger
                .entry(join_type.clone())
                .or_default()
                .push((index, Role::Join));
        }
        self.by_owner.insert(owner_key, index);
        self.registrations.push(registration);
        true
    }

    pub fn registration(&self, owner_type: &str, collection: &str) -> Option<&Registration> {
        self.by_owner
            .get(&(owner_type.to_string(), collection.to_string()))
            .map(|index| &self.registrations[*index])
    }

    /// Registrations triggered by `event` on a record of `changed_type`, in
    /// registration order.
    pub fn dependents(&self, changed_type: &str, event: LifecycleEvent) -> Vec<Dependent<'_>> {
        self.by_trigger
            .get(changed_type)
            .into_iter()
            .flatten()
            .filter_map(|(index, role)| {
                let registration = &self.registrations[*index];
                registration.on.contains(&event).then_some(Dependent {
                    registration,
                    role: *role,
                })
            })
            .collect()
    }

    /// Every `(type, event)` pair some registration listens to.
    pub fn triggers(&self) -> BTreeSet<(String, LifecycleEvent)> {
        let mut triggers = BTreeSet::new();
        for (changed_type, entries) in &self.by_trigger {
            for (index, _) in entries {
                for event in &self.registrations[*index].on {
                    triggers.insert((changed_type.clone(), *event));
                }
            }
        }
        triggers
    }

    /// Registrations owned by `owner_type`.
    pub fn owned_by<'a>(&'a self, owner_type: &str) -> impl Iterator<Item = &'a Registration> + use<'a> {
        let owner_type = owner_type.to_string();
        self.registrations
            .iter()
            .filter(move |registration| registration.owner_type == owner_type)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
