use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::Config;
use crate::flags::flag_source::{FeatureOverride, FlagSourceError, OverrideStore};
use crate::metrics::consts::DB_OVERRIDE_READS_COUNTER;
use crate::metrics::utils::inc;

const DATABASE_TIMEOUT_MILLISECS: u64 = 1000;

/// Reads organization overrides from Postgres.
///
/// Expected schema:
///
/// ```text
/// organizations (id TEXT PRIMARY KEY, ...)
/// organization_feature_overrides (
///     organization_id TEXT REFERENCES organizations(id),
///     feature_name    TEXT NOT NULL,
///     enabled         BOOLEAN NOT NULL
/// )
/// ```
#[derive(Clone)]
pub struct PostgresOverrideStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresOverrideStore {
    pub async fn new(config: &Config) -> Result<Self, FlagSourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.database_url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_millis(DATABASE_TIMEOUT_MILLISECS),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn org_exists(&self, org_id: &str) -> Result<bool, FlagSourceError> {
        let query = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE id = $1)",
        )
        .bind(org_id)
        .fetch_one(&self.pool);

        Ok(timeout(self.query_timeout, query)
            .await
            .map_err(|_| FlagSourceError::SourceUnavailable("query timed out".to_string()))??)
    }
}

#[async_trait]
impl OverrideStore for PostgresOverrideStore {
    #[instrument(skip(self))]
    async fn fetch_overrides(&self, org_id: &str) -> Result<Vec<FeatureOverride>, FlagSourceError> {
        if !self.org_exists(org_id).await? {
            return Err(FlagSourceError::NotFound(org_id.to_string()));
        }

        let query = sqlx::query_as::<_, (String, bool)>(
            "SELECT feature_name, enabled FROM organization_feature_overrides WHERE organization_id = $1",
        )
        .bind(org_id)
        .fetch_all(&self.pool);

        let rows = timeout(self.query_timeout, query)
            .await
            .map_err(|_| FlagSourceError::SourceUnavailable("query timed out".to_string()))??;

        inc(DB_OVERRIDE_READS_COUNTER, &[], 1);

        Ok(rows
            .into_iter()
            .map(|(feature_name, enabled)| FeatureOverride {
                feature_name,
                enabled,
            })
            .collect())
    }
}
