use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::ConfigError;
use crate::normalize::normalize_value;

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let builder = PgPoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ));

        builder.connect(&self.db_url).await
    }
}

/// The ordered set of attributes whose changes produce new versions. Fixed for the lifetime of a
/// history table - the store records it on first use and refuses runs with a different set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAttributes(Vec<String>);

impl TrackedAttributes {
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for name in names {
            let name: String = name.into();
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateTrackedAttribute(name));
            }
            ordered.push(name);
        }
        if ordered.is_empty() {
            return Err(ConfigError::NoTrackedAttributes);
        }
        Ok(Self(ordered))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }
}

impl FromStr for TrackedAttributes {
    type Err = ConfigError;

    // Comma separated, e.g. "division,audit_phase"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackedAttributes::new(s.split(','))
    }
}

/// What to do with a record failing domain validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    // Keep the record, flag it in the run report
    Warn,
    // Quarantine the record
    Reject,
}

impl FromStr for ValidationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Ok(ValidationPolicy::Warn),
            "reject" => Ok(ValidationPolicy::Reject),
            _ => Err(ConfigError::InvalidPolicy(s.to_string(), "warn, reject")),
        }
    }
}

/// What to do with a live snapshot for an entity whose history ends in a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostDeletionPolicy {
    // Log and count an anomaly, otherwise ignore the snapshot
    Warn,
    // Quarantine the snapshot
    Reject,
}

impl FromStr for PostDeletionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Ok(PostDeletionPolicy::Warn),
            "reject" => Ok(PostDeletionPolicy::Reject),
            _ => Err(ConfigError::InvalidPolicy(s.to_string(), "warn, reject")),
        }
    }
}

/// What to do when the post-run audit finds invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    Warn,
    // Refuse further runs until the engine is explicitly resumed
    Fail,
}

impl FromStr for IntegrityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Ok(IntegrityPolicy::Warn),
            "fail" => Ok(IntegrityPolicy::Fail),
            _ => Err(ConfigError::InvalidPolicy(s.to_string(), "warn, fail")),
        }
    }
}

pub type AllowLists = HashMap<String, HashSet<String>>;

// Parses "division=North|South;audit_phase=Phase1|Phase2". Values are normalized the same way
// snapshot values are, so the comparison is like-for-like.
pub fn parse_allow_lists(raw: &str) -> Result<AllowLists, ConfigError> {
    let mut lists = AllowLists::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((attribute, values)) = entry.split_once('=') else {
            return Err(ConfigError::InvalidAllowList(entry.to_string()));
        };
        let attribute = attribute.trim();
        if attribute.is_empty() {
            return Err(ConfigError::InvalidAllowList(entry.to_string()));
        }
        let allowed = lists.entry(attribute.to_string()).or_default();
        allowed.extend(values.split('|').filter_map(|v| normalize_value(Some(v))));
    }
    Ok(lists)
}

pub const DEFAULT_MERGE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MERGE_RETRY_DELAY_MS: u64 = 50;
pub const DEFAULT_QUARANTINE_SAMPLE_SIZE: usize = 10;
pub const DEFAULT_MAX_STALENESS_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tracked_attributes: TrackedAttributes,
    pub retain_intermediate_changes: bool,
    pub on_validation_failure: ValidationPolicy,
    pub on_post_deletion_snapshot: PostDeletionPolicy,
    pub on_integrity_violation: IntegrityPolicy,
    pub domain_allow_lists: AllowLists,
    pub merge_max_attempts: u32,
    pub merge_retry_delay_ms: u64,
    // How many quarantined records, anomalies and violations are copied into the run report
    pub quarantine_sample_size: usize,
    pub max_staleness_hours: i64,
}

impl EngineConfig {
    pub fn new(tracked_attributes: TrackedAttributes) -> Self {
        Self {
            tracked_attributes,
            retain_intermediate_changes: false,
            on_validation_failure: ValidationPolicy::Warn,
            on_post_deletion_snapshot: PostDeletionPolicy::Warn,
            on_integrity_violation: IntegrityPolicy::Warn,
            domain_allow_lists: AllowLists::new(),
            merge_max_attempts: DEFAULT_MERGE_MAX_ATTEMPTS,
            merge_retry_delay_ms: DEFAULT_MERGE_RETRY_DELAY_MS,
            quarantine_sample_size: DEFAULT_QUARANTINE_SAMPLE_SIZE,
            max_staleness_hours: DEFAULT_MAX_STALENESS_HOURS,
        }
    }

    pub fn with_allow_lists(mut self, lists: AllowLists) -> Result<Self, ConfigError> {
        for attribute in lists.keys() {
            if self.tracked_attributes.position(attribute).is_none() {
                return Err(ConfigError::UntrackedAllowList(attribute.clone()));
            }
        }
        self.domain_allow_lists = lists;
        Ok(self)
    }

    // Absent values always pass; nullability isn't a domain concern
    pub fn is_allowed(&self, attribute: &str, value: Option<&str>) -> bool {
        match (self.domain_allow_lists.get(attribute), value) {
            (Some(allowed), Some(value)) => allowed.contains(value),
            _ => true,
        }
    }
}
