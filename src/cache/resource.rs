//! Resource identity and the record-layer contract.
//!
//! The cache never loads records itself. It sees a record as a
//! [`ResourceRef`] (type name plus primary identifier) and asks a
//! [`RecordSource`] whenever an association map has to be rebuilt.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::CacheError;

/// Primary identifier of a record.
///
/// Integer and string identifiers never compare equal, even when they
/// print the same way.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
    Int(i64),
    Str(String),
}

impl ResourceId {
    /// Encodes the id for storage inside backend sets.
    pub fn encode(&self) -> String {
        match self {
            Self::Int(value) => format!("i:{value}"),
            Self::Str(value) => format!("s:{value}"),
        }
    }

    /// Decodes a value produced by [`ResourceId::encode`].
    pub fn decode(raw: &str) -> Option<Self> {
        let (tag, value) = raw.split_once(':')?;
        match tag {
            "i" => value.parse().ok().map(Self::Int),
            "s" => Some(Self::Str(value.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for ResourceId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ResourceId {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for ResourceId {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// A record as the cache sees it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    resource_type: String,
    id: ResourceId,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: impl Into<ResourceId>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource_type, self.id)
    }
}

/// Implemented by domain records that participate in caching.
pub trait Resource {
    fn resource_ref(&self) -> ResourceRef;
}

impl Resource for ResourceRef {
    fn resource_ref(&self) -> ResourceRef {
        self.clone()
    }
}

/// Authoritative source of association data, supplied by the record layer.
///
/// Called only when a cached association map is missing.
pub trait RecordSource: Send + Sync {
    /// Ids currently reachable from `owner` through `collection`.
    fn related_ids(
        &self,
        owner: &ResourceRef,
        collection: &str,
    ) -> Result<BTreeSet<ResourceId>, CacheError>;

    /// Ids of every `owner_type` record whose `collection` contains `related`.
    fn owner_ids(
        &self,
        owner_type: &str,
        collection: &str,
        related: &ResourceRef,
    ) -> Result<BTreeSet<ResourceId>, CacheError>;

    /// Every persisted id of `resource_type`. Used only to warm maps.
    fn resource_ids(&self, resource_type: &str) -> Result<Vec<ResourceId>, CacheError> {
        let _ = resource_type;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_encoding_keeps_kinds_apart() {
        let int = ResourceId::from(42_i64);
        let text = ResourceId::from("42");

        assert_ne!(int.encode(), text.encode());
        assert_eq!(ResourceId::decode(&int.encode()), Some(int));
        assert_eq!(ResourceId::decode(&text.encode()), Some(text));
    }

    #[test]
    fn decode_rejects_unknown_tags() {
        assert_eq!(ResourceId::decode("x:1"), None);
        assert_eq!(ResourceId::decode("i:not-a-number"), None);
        assert_eq!(ResourceId::decode("no-tag"), None);
    }

    #[test]
    fn string_ids_may_contain_separator() {
        let id = ResourceId::from("a:b");
        assert_eq!(ResourceId::decode(&id.encode()), Some(id));
    }

    #[test]
    fn resource_ref_display() {
        let resource = ResourceRef::new("Cacher", "foo");
        assert_eq!(resource.to_string(), "Cacher#foo");
        assert_eq!(resource.resource_ref(), resource);
    }
}
