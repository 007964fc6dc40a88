use std::collections::BTreeMap;

use regex::Regex;

use crate::flags::flag_models::{FlagSet, UserId};

/// Flag names starting with `exp` or `experiment` followed by `-`, `_` or `:`.
pub const DEFAULT_EXPERIMENT_PATTERN: &str = r"^(exp|experiment)[-_:]";

/// Freezes experiment flags at their first observed value for one user.
///
/// Flags whose name matches the experiment pattern are assigned the first value seen for them
/// and keep it until [`StickyPolicy::clear`], whatever later payloads say. Every other flag is
/// operational and passes through untouched. A flag that is absent from a payload has not been
/// observed by [`StickyPolicy::resolve`]; reading it through [`StickyPolicy::observe`] freezes
/// its implicit `false`.
#[derive(Debug, Clone)]
pub struct StickyPolicy {
    user_id: UserId,
    pattern: Regex,
    assignments: BTreeMap<String, bool>,
}

impl StickyPolicy {
    pub fn new(user_id: impl Into<UserId>, pattern: Regex) -> Self {
        Self {
            user_id: user_id.into(),
            pattern,
            assignments: BTreeMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_experiment(&self, flag_name: &str) -> bool {
        self.pattern.is_match(flag_name)
    }

    /// Records first observations from `live` and returns what consumers should see.
    pub fn resolve(&mut self, live: &FlagSet) -> FlagSet {
        for (name, value) in live.iter() {
            if self.is_experiment(name) && !self.assignments.contains_key(name) {
                tracing::debug!(user_id = %self.user_id, flag = %name, value, "Assigned sticky experiment value");
                self.assignments.insert(name.clone(), *value);
            }
        }

        let mut resolved = live.clone();
        for (name, value) in &self.assignments {
            resolved.set(name.clone(), *value);
        }
        resolved
    }

    /// Freezes `value` for an experiment flag that has no assignment yet. Returns whether a new
    /// assignment was recorded.
    pub fn observe(&mut self, flag_name: &str, value: bool) -> bool {
        if !self.is_experiment(flag_name) || self.assignments.contains_key(flag_name) {
            return false;
        }
        tracing::debug!(user_id = %self.user_id, flag = %flag_name, value, "Assigned sticky experiment value on read");
        self.assignments.insert(flag_name.to_string(), value);
        true
    }

    /// Reinstates assignments saved for `user_id`. Assignments that belong to someone else, or
    /// that no longer match the pattern, are ignored.
    pub fn restore(&mut self, user_id: &str, assignments: &BTreeMap<String, bool>) {
        if user_id != self.user_id {
            return;
        }
        for (name, value) in assignments {
            if self.is_experiment(name) {
                self.assignments.entry(name.clone()).or_insert(*value);
            }
        }
    }

    pub fn assignments(&self) -> &BTreeMap<String, bool> {
        &self.assignments
    }

    pub fn clear(&mut self) {
        self.assignments.clear();
    }
}
