use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::normalize::normalize_values;
use crate::types::{OrderKey, Version};

/// The slice of history one run works against for a single entity: every stored version, plus
/// the versions planned so far in this run, kept sorted by `Version::order_key`.
#[derive(Debug, Clone)]
pub struct EntityHistory {
    entity_id: String,
    versions: Vec<Version>,
    pending: HashSet<String>,
}

impl EntityHistory {
    pub fn new(entity_id: &str, mut stored: Vec<Version>) -> Self {
        // Stored values go through the same normalization as incoming ones, so rows written by
        // other tools still compare like-for-like
        for version in stored.iter_mut() {
            version.values = normalize_values(&version.values);
        }
        stored.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Self {
            entity_id: entity_id.to_string(),
            versions: stored,
            pending: HashSet::new(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.versions.iter().any(|v| v.version_id == version_id)
    }

    pub fn is_pending(&self, version_id: &str) -> bool {
        self.pending.contains(version_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    // The version in effect at `at`: the last one with effective_from <= at
    pub fn baseline(&self, at: DateTime<Utc>) -> Option<&Version> {
        let idx = self.versions.partition_point(|v| v.effective_from <= at);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    // Neighbours of a not-yet-inserted key
    pub fn predecessor(&self, key: OrderKey<'_>) -> Option<&Version> {
        let idx = self.versions.partition_point(|v| v.order_key() < key);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    pub fn successor(&self, key: OrderKey<'_>) -> Option<&Version> {
        let idx = self.versions.partition_point(|v| v.order_key() <= key);
        self.versions.get(idx)
    }

    pub fn last(&self) -> Option<&Version> {
        self.versions.last()
    }

    // Adds a version planned by this run, keeping the order
    pub fn insert_pending(&mut self, version: Version) {
        let idx = self
            .versions
            .partition_point(|v| v.order_key() < version.order_key());
        self.pending.insert(version.version_id.clone());
        self.versions.insert(idx, version);
    }

    pub fn into_versions(self) -> Vec<Version> {
        self.versions
    }
}
