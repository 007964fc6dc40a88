use serde::Deserialize;

use crate::api::errors::FlagError;

/// Query parameters shared by `/flags` and `/flags/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagsQueryParams {
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "orgId")]
    pub org_id: Option<String>,
    /// Fingerprint the client already holds; a match yields 304.
    pub fingerprint: Option<String>,
}

impl FlagsQueryParams {
    /// Both ids, trimmed and required to be non-empty.
    pub fn identity(&self) -> Result<(String, String), FlagError> {
        let user_id = non_empty(self.user_id.as_deref()).ok_or(FlagError::MissingUserId)?;
        let org_id = non_empty(self.org_id.as_deref()).ok_or(FlagError::MissingOrgId)?;
        Ok((user_id, org_id))
    }
}

/// Body of `POST /flags/invalidate`. Omitted fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default, alias = "org_id")]
    pub org_id: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
