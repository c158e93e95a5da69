//! Offline verification of index content against the authoritative store.
//!
//! Both sides are streamed in URI order and merged, so a check touches each
//! resource once and never holds more than one group of entries in memory.

use crate::error::Result;
use crate::index::PropertySetIndex;
use crate::store::{IndexDao, PropertySetStream};
use crate::types::AuthorizedPropertySet;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyError {
    /// Present in the store, absent from the index.
    MissingInIndex { uri: String },
    /// Present in the index, absent from the store.
    DanglingInIndex { uri: String },
    /// Indexed more than once.
    MultiplesInIndex { uri: String, count: usize },
    /// Indexed property set or read principals differ from the store.
    InvalidData { uri: String },
}

impl ConsistencyError {
    pub fn uri(&self) -> &str {
        match self {
            Self::MissingInIndex { uri }
            | Self::DanglingInIndex { uri }
            | Self::MultiplesInIndex { uri, .. }
            | Self::InvalidData { uri } => uri,
        }
    }

    const fn needs_reinsert(&self) -> bool {
        !matches!(self, Self::DanglingInIndex { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ConsistencyReport {
    pub index_id: String,
    pub store_resources: usize,
    pub index_entries: usize,
    pub errors: Vec<ConsistencyError>,
    pub elapsed_ms: u64,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fix every recorded error in `index` and commit. The caller holds the
    /// index lock. Returns the number of errors repaired.
    pub fn repair(&self, index: &dyn PropertySetIndex, dao: &dyn IndexDao) -> Result<usize> {
        if self.errors.is_empty() {
            return Ok(0);
        }

        let mut reinsert = Vec::new();
        for error in &self.errors {
            index.delete_property_set(error.uri())?;
            if error.needs_reinsert() {
                reinsert.push(error.uri().to_string());
            }
        }

        let mut reinserted = 0usize;
        if !reinsert.is_empty() {
            for resource in dao.property_sets_for_uris(&reinsert)? {
                let resource = resource?;
                index.add_property_set(&resource.property_set, &resource.acl_read_principals)?;
                reinserted += 1;
            }
        }

        index.commit()?;
        info!(
            "Repaired {} consistency errors in index '{}' ({reinserted} reinserted)",
            self.errors.len(),
            index.id()
        );
        Ok(self.errors.len())
    }
}

/// Compares a property-set index against the authoritative store.
pub struct ConsistencyCheck;

impl ConsistencyCheck {
    /// The caller holds the index lock for the duration of the check.
    pub fn run(index: &dyn PropertySetIndex, dao: &dyn IndexDao) -> Result<ConsistencyReport> {
        let started = Instant::now();
        let mut index_entries = index.property_sets()?.peekable();
        let mut store_entries = dao.all_property_sets()?;

        let mut errors = Vec::new();
        let mut store_resources = 0usize;
        let mut index_count = 0usize;

        let mut store_next = store_entries.next().transpose()?;
        let mut index_next = next_group(&mut index_entries)?;

        loop {
            match (store_next.take(), index_next.take()) {
                (None, None) => break,
                (Some(stored), None) => {
                    store_resources += 1;
                    errors.push(ConsistencyError::MissingInIndex {
                        uri: stored.property_set.uri,
                    });
                    store_next = store_entries.next().transpose()?;
                }
                (None, Some(group)) => {
                    index_count += group.count;
                    errors.push(ConsistencyError::DanglingInIndex {
                        uri: group.entry.property_set.uri,
                    });
                    index_next = next_group(&mut index_entries)?;
                }
                (Some(stored), Some(group)) => match stored.uri().cmp(group.entry.uri()) {
                    Ordering::Less => {
                        store_resources += 1;
                        errors.push(ConsistencyError::MissingInIndex {
                            uri: stored.property_set.uri,
                        });
                        store_next = store_entries.next().transpose()?;
                        index_next = Some(group);
                    }
                    Ordering::Greater => {
                        index_count += group.count;
                        errors.push(ConsistencyError::DanglingInIndex {
                            uri: group.entry.property_set.uri,
                        });
                        index_next = next_group(&mut index_entries)?;
                        store_next = Some(stored);
                    }
                    Ordering::Equal => {
                        store_resources += 1;
                        index_count += group.count;
                        if group.count > 1 {
                            errors.push(ConsistencyError::MultiplesInIndex {
                                uri: stored.property_set.uri,
                                count: group.count,
                            });
                        } else if stored != group.entry {
                            errors.push(ConsistencyError::InvalidData {
                                uri: stored.property_set.uri,
                            });
                        }
                        store_next = store_entries.next().transpose()?;
                        index_next = next_group(&mut index_entries)?;
                    }
                },
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let report = ConsistencyReport {
            index_id: index.id().to_string(),
            store_resources,
            index_entries: index_count,
            errors,
            elapsed_ms,
        };
        if report.is_consistent() {
            info!(
                "Index '{}' is consistent ({} resources, {elapsed_ms}ms)",
                report.index_id, report.store_resources
            );
        } else {
            warn!(
                "Index '{}' has {} consistency errors",
                report.index_id,
                report.errors.len()
            );
        }
        Ok(report)
    }
}

/// Consecutive index entries sharing one URI.
struct EntryGroup {
    entry: AuthorizedPropertySet,
    count: usize,
}

fn next_group(entries: &mut Peekable<PropertySetStream<'_>>) -> Result<Option<EntryGroup>> {
    let Some(entry) = entries.next().transpose()? else {
        return Ok(None);
    };
    let mut count = 1;
    while entries
        .peek()
        .is_some_and(|next| matches!(next, Ok(next) if next.uri() == entry.uri()))
    {
        entries.next();
        count += 1;
    }
    Ok(Some(EntryGroup { entry, count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::store::MemoryResourceStore;
    use crate::types::{PrincipalSet, Property, PropertySet, PropertyValue};
    use pretty_assertions::assert_eq;

    fn resource(uri: &str, title: &str) -> AuthorizedPropertySet {
        AuthorizedPropertySet::new(
            PropertySet::new(uri, "file")
                .with_property(Property::single("title", PropertyValue::String(title.into()))),
            ["pseudo:all".to_string()].into_iter().collect::<PrincipalSet>(),
        )
    }

    fn index_with(entries: &[AuthorizedPropertySet]) -> MemoryPropertySetIndex {
        let index = MemoryPropertySetIndex::new("main");
        for entry in entries {
            index
                .add_property_set(&entry.property_set, &entry.acl_read_principals)
                .unwrap();
        }
        index.commit().unwrap();
        index
    }

    #[test]
    fn matching_sides_are_consistent() {
        let store = MemoryResourceStore::new();
        let a = resource("/a", "A");
        store.put(a.clone()).unwrap();
        let index = index_with(&[a]);

        let report = ConsistencyCheck::run(&index, &store).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.store_resources, 1);
        assert_eq!(report.index_entries, 1);
    }

    #[test]
    fn detects_missing_dangling_and_invalid() {
        let store = MemoryResourceStore::new();
        store.put(resource("/a", "A")).unwrap();
        store.put(resource("/b", "B")).unwrap();
        store.put(resource("/d", "D")).unwrap();
        let index = index_with(&[resource("/b", "stale"), resource("/c", "C"), resource("/d", "D")]);

        let report = ConsistencyCheck::run(&index, &store).unwrap();
        assert_eq!(
            report.errors,
            vec![
                ConsistencyError::MissingInIndex { uri: "/a".into() },
                ConsistencyError::InvalidData { uri: "/b".into() },
                ConsistencyError::DanglingInIndex { uri: "/c".into() },
            ]
        );
    }

    #[test]
    fn repair_converges_to_store() {
        let store = MemoryResourceStore::new();
        store.put(resource("/a", "A")).unwrap();
        store.put(resource("/b", "B")).unwrap();
        let index = index_with(&[resource("/b", "stale"), resource("/z", "Z")]);

        let report = ConsistencyCheck::run(&index, &store).unwrap();
        assert_eq!(report.repair(&index, &store).unwrap(), 3);

        let again = ConsistencyCheck::run(&index, &store).unwrap();
        assert!(again.is_consistent());
        assert_eq!(index.committed_uris(), vec!["/a", "/b"]);
    }
}
