use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Root URI of the resource tree.
pub const ROOT_URI: &str = "/";

/// Change-log partition an updater consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoggerPartition {
    pub logger_type: i32,
    pub logger_id: i32,
}

impl LoggerPartition {
    #[must_use]
    pub const fn new(logger_type: i32, logger_id: i32) -> Self {
        Self {
            logger_type,
            logger_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Created,
    ModifiedProps,
    ModifiedContent,
    ModifiedAcl,
    Deleted,
}

impl ChangeOperation {
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// One observed mutation of a resource. Entries are never mutated after they
/// are logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub id: u64,
    pub partition: LoggerPartition,
    pub uri: String,
    /// Stable numeric identity, `-1` when unknown.
    #[serde(default = "unknown_resource_id")]
    pub resource_id: i64,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub is_collection: bool,
}

const fn unknown_resource_id() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    DateMillis(i64),
    Principal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Property {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub values: Vec<PropertyValue>,
}

impl Property {
    pub fn single(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            values: vec![value],
        }
    }
}

/// Indexed representation of a resource. Replaced wholesale on update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertySet {
    pub uri: String,
    pub resource_type: String,
    #[serde(default = "unknown_resource_id")]
    pub resource_id: i64,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl PropertySet {
    pub fn new(uri: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            resource_type: resource_type.into(),
            resource_id: unknown_resource_id(),
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Principals granted read access to a resource.
pub type PrincipalSet = BTreeSet<String>;

/// A property set paired with the principals allowed to read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizedPropertySet {
    pub property_set: PropertySet,
    #[serde(default)]
    pub acl_read_principals: PrincipalSet,
}

impl AuthorizedPropertySet {
    pub fn new(property_set: PropertySet, acl_read_principals: PrincipalSet) -> Self {
        Self {
            property_set,
            acl_read_principals,
        }
    }

    pub fn uri(&self) -> &str {
        &self.property_set.uri
    }
}

/// `true` when `uri` is `root` itself or lies below it.
#[must_use]
pub fn is_in_tree(root: &str, uri: &str) -> bool {
    if root == ROOT_URI {
        return true;
    }
    let root = root.trim_end_matches('/');
    uri == root
        || uri
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_membership() {
        assert!(is_in_tree("/a", "/a"));
        assert!(is_in_tree("/a", "/a/b/c"));
        assert!(is_in_tree("/a/", "/a/b"));
        assert!(!is_in_tree("/a", "/ab"));
        assert!(!is_in_tree("/a/b", "/a"));
        assert!(is_in_tree("/", "/anything"));
    }

    #[test]
    fn entry_defaults_resource_id() {
        let entry: ChangeLogEntry = serde_json::from_str(
            r#"{"id":1,"partition":{"logger_type":1,"logger_id":1},"uri":"/a","operation":"created"}"#,
        )
        .unwrap();
        assert_eq!(entry.resource_id, -1);
        assert!(!entry.is_collection);
        assert!(!entry.operation.is_delete());
    }
}
