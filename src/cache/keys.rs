//! Cache key definitions.
//!
//! Every key the cache persists is derived here. The layout is part of the
//! compatibility surface: processes sharing one backend must agree on it.
//!
//! | kind            | layout                                         |
//! |-----------------|------------------------------------------------|
//! | content         | `{type}/{id}/{member}[/{format}]/{page}`       |
//! | forward map     | `map#{type}/{id}/{collection}`                 |
//! | reverse map     | `rmap#{related_type}/{collection}/{owner_type}`|
//! | reverse bucket  | `{reverse map}/{related_id}`                   |
//! | class timestamp | `cts#{type}[/{format}]`                        |
//! | timestamp       | `ts#{type}[/{id}]/{member}`                    |
//! | versioned       | `{base}@{token}[@{extra}]`                     |
//!
//! String ids that would print like an integer id carry a `%s` prefix.
//! Components are escaped so that no input can produce a separator, which
//! keeps every builder injective.

use std::fmt::Write as _;

use crate::error::CacheError;

use super::resource::{ResourceId, ResourceRef};

const MAP_PREFIX: &str = "map#";
const REVERSE_MAP_PREFIX: &str = "rmap#";
const TIMESTAMP_PREFIX: &str = "ts#";
const CLASS_TIMESTAMP_PREFIX: &str = "cts#";
/// Never produced by [`push_component`], which only emits `%` as an escape.
const NUMERIC_STR_MARKER: &str = "%s";
const VERSION_SEPARATOR: char = '@';

/// Owner of a timestamp token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimestampScope {
    /// Shared by every record of a type.
    Class(String),
    /// Private to one record.
    Instance(ResourceRef),
}

impl TimestampScope {
    fn write_to(&self, out: &mut String) {
        match self {
            Self::Class(resource_type) => push_component(out, resource_type),
            Self::Instance(resource) => {
                push_component(out, resource.resource_type());
                out.push('/');
                push_id(out, resource.id());
            }
        }
    }
}

/// Content key for one `(resource, member, format, page)` tuple.
///
/// `page` defaults to 1. An absent format is omitted entirely, so the
/// unformatted and formatted variants never collide.
pub fn content_key(
    resource: &ResourceRef,
    member: &str,
    format: Option<&str>,
    page: Option<u32>,
) -> Result<String, CacheError> {
    validate_name("resource type", resource.resource_type())?;
    validate_name("member", member)?;
    if let Some(format) = format {
        validate_name("format", format)?;
    }
    let page = page.unwrap_or(1);
    if page == 0 {
        return Err(CacheError::validation("page numbers start at 1"));
    }

    let mut key = String::new();
    push_component(&mut key, resource.resource_type());
    key.push('/');
    push_id(&mut key, resource.id());
    key.push('/');
    push_component(&mut key, member);
    if let Some(format) = format {
        key.push('/');
        push_component(&mut key, format);
    }
    let _ = write!(key, "/{page}");
    Ok(key)
}

/// Forward association map key for `owner.collection`.
pub fn map_key(owner: &ResourceRef, collection: &str) -> Result<String, CacheError> {
    validate_name("resource type", owner.resource_type())?;
    validate_name("collection", collection)?;

    let mut key = String::from(MAP_PREFIX);
    push_component(&mut key, owner.resource_type());
    key.push('/');
    push_id(&mut key, owner.id());
    key.push('/');
    push_component(&mut key, collection);
    Ok(key)
}

/// Class-level reverse map key. Use [`bucket_key`] to scope it to one
/// related record.
pub fn reverse_map_key(
    related_type: &str,
    collection: &str,
    owner_type: &str,
) -> Result<String, CacheError> {
    validate_name("related type", related_type)?;
    validate_name("collection", collection)?;
    validate_name("owner type", owner_type)?;

    let mut key = String::from(REVERSE_MAP_PREFIX);
    push_component(&mut key, related_type);
    key.push('/');
    push_component(&mut key, collection);
    key.push('/');
    push_component(&mut key, owner_type);
    Ok(key)
}

/// Scopes a class-level key to one record id.
pub fn bucket_key(base: &str, id: &ResourceId) -> String {
    let mut key = String::with_capacity(base.len() + 16);
    key.push_str(base);
    key.push('/');
    push_id(&mut key, id);
    key
}

/// Timestamp token key for `member` under `scope`.
pub fn timestamp_key(scope: &TimestampScope, member: &str) -> Result<String, CacheError> {
    validate_name("member", member)?;
    validate_scope(scope)?;

    let mut key = String::from(TIMESTAMP_PREFIX);
    scope.write_to(&mut key);
    key.push('/');
    push_component(&mut key, member);
    Ok(key)
}

/// Class-wide timestamp key, optionally per format.
pub fn class_timestamp_key(resource_type: &str, format: Option<&str>) -> Result<String, CacheError> {
    validate_name("resource type", resource_type)?;

    let mut key = String::from(CLASS_TIMESTAMP_PREFIX);
    push_component(&mut key, resource_type);
    if let Some(format) = format {
        validate_name("format", format)?;
        key.push('/');
        push_component(&mut key, format);
    }
    Ok(key)
}

/// Appends a timestamp token, and optionally a caller-supplied component,
/// to a base key.
pub fn versioned_key(base: &str, token: &str, extra: Option<&str>) -> String {
    let mut key = String::with_capacity(base.len() + token.len() + 8);
    key.push_str(base);
    key.push(VERSION_SEPARATOR);
    push_component(&mut key, token);
    if let Some(extra) = extra {
        key.push(VERSION_SEPARATOR);
        push_component(&mut key, extra);
    }
    key
}

fn validate_name(what: &str, value: &str) -> Result<(), CacheError> {
    if value.is_empty() {
        return Err(CacheError::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn validate_scope(scope: &TimestampScope) -> Result<(), CacheError> {
    match scope {
        TimestampScope::Class(resource_type) => validate_name("resource type", resource_type),
        TimestampScope::Instance(resource) => validate_name("resource type", resource.resource_type()),
    }
}

fn push_id(out: &mut String, id: &ResourceId) {
    match id {
        ResourceId::Int(value) => {
            let _ = write!(out, "{value}");
        }
        ResourceId::Str(value) => {
            if value.parse::<i64>().is_ok() {
                out.push_str(NUMERIC_STR_MARKER);
            }
            push_component(out, value)
        }
    }
}

fn push_component(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '#' => out.push_str("%23"),
            '@' => out.push_str("%40"),
            other => out.push(other),
        }
    }
}
