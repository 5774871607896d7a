//! Invalidation execution.
//!
//! Invalidating a member deletes its content variants (delete style) and
//! always resets its instance timestamp, which also strands every versioned
//! key. Chained members follow recursively.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::error::CacheError;

use super::adapter::StorageAdapter;
use super::associations::AssociationMaps;
use super::config::CacheConfig;
use super::keys::{self, TimestampScope};
use super::map::{CacheMap, InvalidationStyle};
use super::planner::InvalidationPlan;
use super::resource::ResourceRef;
use super::timestamps::TimestampRegistry;

const METRIC_KEYS_DELETED: &str = "cache_machine_keys_deleted_total";
const METRIC_INVALIDATION_MS: &str = "cache_machine_invalidation_ms";

/// What one invalidation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// `(owner, member)` pairs invalidated, cascades included.
    pub members: usize,
    /// Content keys that existed and were deleted.
    pub keys_deleted: usize,
}

impl InvalidationReport {
    fn merge(&mut self, other: Self) {
        self.members += other.members;
        self.keys_deleted += other.keys_deleted;
    }
}

pub struct Invalidator {
    config: CacheConfig,
    map: Arc<CacheMap>,
    storage: Arc<dyn StorageAdapter>,
    timestamps: Arc<TimestampRegistry>,
    associations: Arc<AssociationMaps>,
}

impl Invalidator {
    pub fn new(
        config: CacheConfig,
        map: Arc<CacheMap>,
        storage: Arc<dyn StorageAdapter>,
        timestamps: Arc<TimestampRegistry>,
        associations: Arc<AssociationMaps>,
    ) -> Self {
        Self {
            config,
            map,
            storage,
            timestamps,
            associations,
        }
    }

    /// Runs a plan: links first, then class timestamps, then owner members.
    pub fn execute(
        &self,
        plan: &InvalidationPlan,
        event: &'static str,
    ) -> Result<InvalidationReport, CacheError> {
        let started_at = Instant::now();

        for link in &plan.links {
            self.associations
                .link(&link.owner, &link.collection, &link.related)?;
        }
        for resource_type in &plan.class_timestamps {
            self.timestamps
                .reset_class(resource_type, self.config.formats.iter().map(String::as_str))?;
        }

        let mut report = InvalidationReport::default();
        for (owner, members) in &plan.targets {
            let mut visited = BTreeSet::new();
            for member in members {
                report.merge(self.cascade(owner, member, &mut visited, &mut Vec::new())?);
            }
        }

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_INVALIDATION_MS, "event" => event).record(elapsed_ms);
        info!(
            event,
            plan = %plan,
            members = report.members,
            keys_deleted = report.keys_deleted,
            elapsed_ms,
            "Invalidation plan executed"
        );
        Ok(report)
    }

    /// Invalidates `member` and everything chained after it.
    pub fn invalidate(
        &self,
        resource: &ResourceRef,
        member: &str,
    ) -> Result<InvalidationReport, CacheError> {
        self.cascade(resource, member, &mut BTreeSet::new(), &mut Vec::new())
    }

    /// Invalidates `member` alone.
    pub fn invalidate_only(
        &self,
        resource: &ResourceRef,
        member: &str,
    ) -> Result<InvalidationReport, CacheError> {
        Ok(InvalidationReport {
            members: 1,
            keys_deleted: self.invalidate_member(resource, member)?,
        })
    }

    /// Invalidates every declared member of the resource's type.
    pub fn invalidate_all(&self, resource: &ResourceRef) -> Result<InvalidationReport, CacheError> {
        let mut visited = BTreeSet::new();
        let mut report = InvalidationReport::default();
        for member in self.map.members_of(resource.resource_type()) {
            report.merge(self.cascade(resource, member, &mut visited, &mut Vec::new())?);
        }
        Ok(report)
    }

    /// Unformatted variant first, then configured and member formats.
    pub fn formats_for(&self, resource_type: &str, member: &str) -> Vec<Option<String>> {
        let mut formats: BTreeSet<&str> = self.config.formats.iter().map(String::as_str).collect();
        if let Some(spec) = self.map.member(resource_type, member) {
            formats.extend(spec.formats.iter().map(String::as_str));
        }
        std::iter::once(None)
            .chain(formats.into_iter().map(|format| Some(format.to_string())))
            .collect()
    }

    fn cascade(
        &self,
        resource: &ResourceRef,
        member: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Result<InvalidationReport, CacheError> {
        if path.iter().any(|seen| seen == member) {
            warn!(
                resource = %resource,
                member,
                path = ?path,
                "cache chain cycle detected; member skipped"
            );
            return Ok(InvalidationReport::default());
        }
        if !visited.insert(member.to_string()) {
            return Ok(InvalidationReport::default());
        }

        let mut report = InvalidationReport {
            members: 1,
            keys_deleted: self.invalidate_member(resource, member)?,
        };

        path.push(member.to_string());
        let dependents: Vec<String> = self
            .map
            .dependents_of(resource.resource_type(), member)
            .map(str::to_string)
            .collect();
        for dependent in dependents {
            report.merge(self.cascade(resource, &dependent, visited, path)?);
        }
        path.pop();
        Ok(report)
    }

    fn invalidate_member(&self, resource: &ResourceRef, member: &str) -> Result<usize, CacheError> {
        let deleted = match self.map.style_of(resource.resource_type(), member) {
            InvalidationStyle::Delete => self.delete_variants(resource, member)?,
            InvalidationStyle::Timestamp => 0,
        };
        self.timestamps
            .reset(&TimestampScope::Instance(resource.clone()), member)?;

        if deleted > 0 {
            counter!(METRIC_KEYS_DELETED).increment(deleted as u64);
        }
        debug!(resource = %resource, member, deleted, "member invalidated");
        Ok(deleted)
    }

    /// Deletes pages 1, 2, ... of every format until the first absent page.
    fn delete_variants(&self, resource: &ResourceRef, member: &str) -> Result<usize, CacheError> {
        let max_pages = self.config.max_probe_pages_non_zero().get();
        let mut deleted = 0;
        for format in self.formats_for(resource.resource_type(), member) {
            let mut page = 1;
            loop {
                let key = keys::content_key(resource, member, format.as_deref(), Some(page))?;
                if !self.storage.delete(&key)? {
                    break;
                }
                deleted += 1;
                if page == max_pages {
                    warn!(
                        resource = %resource,
                        member,
                        format = format.as_deref().unwrap_or("-"),
                        max_pages,
                        "page probe limit reached"
                    );
                    break;
                }
                page += 1;
            }
        }
        Ok(deleted)
    }
}
