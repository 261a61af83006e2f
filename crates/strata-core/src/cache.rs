use crate::CoreError;
use std::collections::HashMap;
use std::path::PathBuf;
use strata_schema::LayerIdentity;
use strata_store::{CacheEntry, CacheRecord, CacheStore, StoreError};
use tracing::debug;

fn cache_err(e: StoreError) -> CoreError {
    CoreError::Cache(e.to_string())
}

/// Decides whether a layer can be reused.
///
/// Persisted records live one per layer in the state directory. Identities
/// seen during this run are kept in memory so a downstream layer chains on
/// the identity its base has *now*, not the one recorded last time.
#[derive(Debug)]
pub struct BuildCache {
    store: CacheStore,
    seen: HashMap<String, LayerIdentity>,
}

impl BuildCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: CacheStore::new(dir),
            seen: HashMap::new(),
        }
    }

    /// The stored entry for `layer`, only if it was built with `identity`.
    pub fn lookup(
        &self,
        layer: &str,
        identity: &LayerIdentity,
    ) -> Result<Option<CacheEntry>, CoreError> {
        let Some(record) = self.store.get(layer).map_err(cache_err)? else {
            debug!("{layer}: no cache record");
            return Ok(None);
        };
        if &record.identity == identity {
            Ok(Some(record.entry))
        } else {
            debug!(
                "{layer}: cached identity {} differs from {}",
                record.identity.short(),
                identity.short()
            );
            Ok(None)
        }
    }

    pub fn put(
        &mut self,
        layer: &str,
        identity: &LayerIdentity,
        entry: CacheEntry,
    ) -> Result<(), CoreError> {
        let record = CacheRecord::new(layer, identity.clone(), entry);
        self.store.put(&record).map_err(cache_err)?;
        self.note_identity(layer, identity.clone());
        Ok(())
    }

    /// Remember the identity `layer` has in this run.
    pub fn note_identity(&mut self, layer: &str, identity: LayerIdentity) {
        self.seen.insert(layer.to_owned(), identity);
    }

    /// Identity to chain on for a built base: this run's, else the persisted one.
    pub fn identity_of(&self, layer: &str) -> Result<Option<LayerIdentity>, CoreError> {
        if let Some(id) = self.seen.get(layer) {
            return Ok(Some(id.clone()));
        }
        Ok(self
            .store
            .get(layer)
            .map_err(cache_err)?
            .map(|r| r.identity))
    }

    pub fn forget(&mut self, layer: &str) -> Result<(), CoreError> {
        self.seen.remove(layer);
        self.store.remove(layer).map_err(cache_err)
    }

    pub fn clear(&mut self) -> Result<usize, CoreError> {
        self.seen.clear();
        self.store.clear().map_err(cache_err)
    }

    pub fn list(&self) -> Result<Vec<CacheRecord>, CoreError> {
        self.store.list().map_err(cache_err)
    }
}
