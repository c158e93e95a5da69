use crate::error::{IndexError, Result};
use crate::types::{is_in_tree, AuthorizedPropertySet};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Lazy, finite sequence of property sets pulled from the authoritative store.
pub type PropertySetStream<'a> = Box<dyn Iterator<Item = Result<AuthorizedPropertySet>> + 'a>;

/// Read access to the authoritative resource store.
///
/// Streams are restartable by calling the method again.
pub trait IndexDao: Send + Sync {
    /// Current state of the given URIs, in URI order. URIs that no longer
    /// exist are omitted.
    fn property_sets_for_uris(&self, uris: &[String]) -> Result<PropertySetStream<'_>>;

    /// Every resource in the store, in URI order.
    fn all_property_sets(&self) -> Result<PropertySetStream<'_>>;
}

/// In-process resource store keyed by URI.
#[derive(Debug, Default)]
pub struct MemoryResourceStore {
    resources: Mutex<BTreeMap<String, AuthorizedPropertySet>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, resource: AuthorizedPropertySet) -> Result<()> {
        self.lock_resources()?
            .insert(resource.uri().to_string(), resource);
        Ok(())
    }

    pub fn remove(&self, uri: &str) -> Result<Option<AuthorizedPropertySet>> {
        Ok(self.lock_resources()?.remove(uri))
    }

    /// Remove `uri` and everything below it; returns the number removed.
    pub fn remove_tree(&self, uri: &str) -> Result<usize> {
        let mut resources = self.lock_resources()?;
        let before = resources.len();
        resources.retain(|key, _| !is_in_tree(uri, key));
        Ok(before - resources.len())
    }

    pub fn get(&self, uri: &str) -> Result<Option<AuthorizedPropertySet>> {
        Ok(self.lock_resources()?.get(uri).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock_resources()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock_resources(&self) -> Result<MutexGuard<'_, BTreeMap<String, AuthorizedPropertySet>>> {
        self.resources
            .lock()
            .map_err(|_| IndexError::Store("resource store mutex poisoned".to_string()))
    }

    fn stream(&self, uris: Vec<String>) -> PropertySetStream<'_> {
        Box::new(
            uris.into_iter()
                .filter_map(move |uri| self.get(&uri).transpose()),
        )
    }
}

impl IndexDao for MemoryResourceStore {
    fn property_sets_for_uris(&self, uris: &[String]) -> Result<PropertySetStream<'_>> {
        let ordered: BTreeSet<String> = uris.iter().cloned().collect();
        Ok(self.stream(ordered.into_iter().collect()))
    }

    fn all_property_sets(&self) -> Result<PropertySetStream<'_>> {
        let uris: Vec<String> = self.lock_resources()?.keys().cloned().collect();
        Ok(self.stream(uris))
    }
}
