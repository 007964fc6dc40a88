use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::flags::flag_source::{FeatureOverride, FlagSourceError, OverrideStore};

/// Process-local override store, used for tests and local runs without Postgres.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryOverrideStore {
    orgs: Arc<RwLock<HashMap<String, Vec<FeatureOverride>>>>,
    unavailable: Arc<AtomicBool>,
    reads: Arc<AtomicU32>,
}

impl InMemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_org(&self, org_id: &str, overrides: Vec<FeatureOverride>) {
        if let Ok(mut orgs) = self.orgs.write() {
            orgs.insert(org_id.to_string(), overrides);
        }
    }

    /// Adds or replaces a single override, creating the organization if needed.
    pub fn set_override(&self, org_id: &str, feature_name: &str, enabled: bool) {
        if let Ok(mut orgs) = self.orgs.write() {
            let overrides = orgs.entry(org_id.to_string()).or_default();
            overrides.retain(|o| o.feature_name != feature_name);
            overrides.push(FeatureOverride::new(feature_name, enabled));
        }
    }

    pub fn remove_org(&self, org_id: &str) {
        if let Ok(mut orgs) = self.orgs.write() {
            orgs.remove(org_id);
        }
    }

    /// While set, every read fails with `SourceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OverrideStore for InMemoryOverrideStore {
    async fn fetch_overrides(&self, org_id: &str) -> Result<Vec<FeatureOverride>, FlagSourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlagSourceError::SourceUnavailable(
                "store marked unavailable".to_string(),
            ));
        }

        let orgs = self
            .orgs
            .read()
            .map_err(|_| FlagSourceError::SourceUnavailable("store lock poisoned".to_string()))?;

        orgs.get(org_id)
            .cloned()
            .ok_or_else(|| FlagSourceError::NotFound(org_id.to_string()))
    }
}
