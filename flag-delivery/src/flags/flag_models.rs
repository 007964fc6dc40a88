use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub type UserId = String;
pub type OrgId = String;

/// A flat flag-name to enabled mapping for one organization.
///
/// Backed by a `BTreeMap` so iteration (and therefore serialization) is always
/// in key order, which is what makes the fingerprint insertion-order independent.
/// Flags that are not present are implicitly disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet(BTreeMap<String, bool>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, name: impl Into<String>) {
        self.0.insert(name.into(), true);
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), value);
    }

    /// Missing flags read as `false`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &bool)> {
        self.0.iter()
    }

    /// Stable digest of the mapping: SHA-1 over the JSON object with sorted keys.
    pub fn fingerprint(&self) -> String {
        // A BTreeMap<String, bool> always serializes; fall back to Debug just in case.
        let serialized =
            serde_json::to_vec(&self.0).unwrap_or_else(|_| format!("{:?}", self.0).into_bytes());
        let mut hasher = Sha1::new();
        hasher.update(&serialized);
        hex::encode(hasher.finalize())
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for FlagSet {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        FlagSet(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<K: Into<String>, const N: usize> From<[(K, bool); N]> for FlagSet {
    fn from(pairs: [(K, bool); N]) -> Self {
        pairs.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: UserId,
    pub org_id: OrgId,
}

impl CacheKey {
    pub fn new(user_id: impl Into<UserId>, org_id: impl Into<OrgId>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
        }
    }

    /// `None` acts as a wildcard for that half of the key.
    pub fn matches(&self, user_id: Option<&str>, org_id: Option<&str>) -> bool {
        user_id.map_or(true, |u| u == self.user_id) && org_id.map_or(true, |o| o == self.org_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.org_id, self.user_id)
    }
}

/// Body of a flags response, also embedded in push events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsResponse {
    pub flags: FlagSet,
    pub fingerprint: String,
    pub computed_at: DateTime<Utc>,
}

impl FlagsResponse {
    /// True for answers that were not computed from the source, see [`fallback_computed_at`].
    pub fn is_fallback(&self) -> bool {
        self.computed_at <= fallback_computed_at()
    }
}

/// Timestamp carried by the empty fallback served when the source is down and nothing is
/// cached. It predates every real computation, so any client already holding flags treats
/// the fallback as older than what it has.
pub fn fallback_computed_at() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}
