use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::flags::flag_models::{FlagSet, OrgId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlagSourceError {
    #[error("flag source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("organization {0} not found")]
    NotFound(OrgId),
}

impl From<sqlx::Error> for FlagSourceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => FlagSourceError::NotFound(String::new()),
            other => {
                tracing::error!("sqlx error: {}", other);
                FlagSourceError::SourceUnavailable(other.to_string())
            }
        }
    }
}

/// One row of an organization's feature configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOverride {
    pub feature_name: String,
    pub enabled: bool,
}

impl FeatureOverride {
    pub fn new(feature_name: impl Into<String>, enabled: bool) -> Self {
        Self {
            feature_name: feature_name.into(),
            enabled,
        }
    }
}

/// Read side of the organization store.
///
/// Implementations return `NotFound` for an unknown organization and
/// `SourceUnavailable` for anything else that goes wrong.
#[async_trait]
pub trait OverrideStore: Send + Sync + 'static {
    async fn fetch_overrides(&self, org_id: &str) -> Result<Vec<FeatureOverride>, FlagSourceError>;
}

/// Computes the authoritative flags for an organization: enabled overrides plus baseline flags.
#[derive(Clone)]
pub struct FlagSource {
    store: Arc<dyn OverrideStore>,
    baseline: Arc<[String]>,
}

impl FlagSource {
    pub fn new(store: Arc<dyn OverrideStore>, baseline: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            baseline: baseline.into_iter().collect(),
        }
    }

    pub fn baseline(&self) -> &[String] {
        &self.baseline
    }

    #[instrument(skip(self))]
    pub async fn compute(&self, org_id: &str) -> Result<FlagSet, FlagSourceError> {
        let overrides = self.store.fetch_overrides(org_id).await.map_err(|e| match e {
            // Stores don't always know which org they were asked about
            FlagSourceError::NotFound(_) => FlagSourceError::NotFound(org_id.to_string()),
            other => other,
        })?;

        let mut flags = FlagSet::new();
        for feature in overrides.into_iter().filter(|o| o.enabled) {
            flags.enable(feature.feature_name);
        }
        for name in self.baseline.iter() {
            flags.enable(name.clone());
        }

        Ok(flags)
    }
}
