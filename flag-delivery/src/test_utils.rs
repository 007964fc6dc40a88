use std::sync::Arc;

use rand::{distributions::Alphanumeric, Rng};

use crate::config::Config;
use crate::database::InMemoryOverrideStore;
use crate::flags::flag_source::{FeatureOverride, FlagSource};
use crate::flags::flags_cache::FlagCache;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Creates an organization with a random id and the given overrides. Returns the id.
pub fn insert_new_org(store: &InMemoryOverrideStore, overrides: &[(&str, bool)]) -> String {
    let org_id = random_string("org_", 12);
    store.insert_org(
        &org_id,
        overrides
            .iter()
            .map(|(name, enabled)| FeatureOverride::new(*name, *enabled))
            .collect(),
    );
    org_id
}

/// A cache over an in-memory store, configured from `config`.
pub fn setup_flag_cache(store: InMemoryOverrideStore, config: &Config) -> FlagCache {
    let source = FlagSource::new(Arc::new(store), config.baseline_flags.iter().cloned());
    FlagCache::new(source, config.cache_ttl(), config.in_flight_ttl())
}
