use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::{EngineConfig, ValidationPolicy};
use crate::error::ValidationError;
use crate::normalize::normalize_value;
use crate::types::{NormalizedSnapshot, Snapshot, Version};

/// A snapshot that made it past validation. `issues` holds allow-list failures that the `warn`
/// policy let through, so the run report can flag them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    pub snapshot: NormalizedSnapshot,
    pub issues: Vec<ValidationError>,
}

pub fn validate(
    config: &EngineConfig,
    position: usize,
    raw: &Snapshot,
) -> Result<Validated, ValidationError> {
    let Some(entity_id) = normalize_value(raw.entity_id.as_deref()) else {
        return Err(ValidationError::MissingEntityId);
    };
    let Some(effective_from) = raw.effective_from else {
        return Err(ValidationError::MissingEffectiveFrom(entity_id));
    };

    let tracked = &config.tracked_attributes;
    for name in raw.tracked_attributes.keys() {
        if tracked.position(name).is_none() {
            debug!(entity_id, attribute = %name, "ignoring untracked attribute");
        }
    }

    let values: Vec<Option<String>> = tracked
        .names()
        .iter()
        .map(|name| normalize_value(raw.tracked_attributes.get(name).and_then(|v| v.as_deref())))
        .collect();

    let mut issues = Vec::new();
    for (name, value) in tracked.names().iter().zip(values.iter()) {
        if config.is_allowed(name, value.as_deref()) {
            continue;
        }
        let issue = ValidationError::ValueNotAllowed {
            attribute: name.clone(),
            value: value.clone().unwrap_or_default(),
        };
        match config.on_validation_failure {
            ValidationPolicy::Reject => return Err(issue),
            ValidationPolicy::Warn => issues.push(issue),
        }
    }

    Ok(Validated {
        snapshot: NormalizedSnapshot {
            position,
            entity_id,
            values,
            effective_from,
            is_deleted: raw.is_deleted,
            is_active: raw.is_active,
        },
        issues,
    })
}

// Each field is length-prefixed so no two distinct inputs share an encoding, and absent values
// get their own marker so they never collide with any string.
pub fn version_id(
    entity_id: &str,
    effective_from: DateTime<Utc>,
    values: &[Option<String>],
    is_deleted: bool,
) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, entity_id.as_bytes());
    write_field(
        &mut hasher,
        effective_from
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update((values.len() as u64).to_le_bytes());
    for value in values {
        match value {
            Some(value) => {
                hasher.update([1u8]);
                write_field(&mut hasher, value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hasher.update([u8::from(is_deleted)]);
    format!("{:x}", hasher.finalize())
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Assembles complete version rows. Currency and sequence numbers set here are provisional; the
/// reconciler settles both once every version of the entity is known.
#[derive(Debug, Clone, Copy)]
pub struct VersionBuilder {
    pub run_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

impl VersionBuilder {
    pub fn new(run_id: Uuid, processed_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            processed_at,
        }
    }

    pub fn build(
        &self,
        snapshot: &NormalizedSnapshot,
        values: Vec<Option<String>>,
        version_id: String,
        existing_versions: usize,
    ) -> Version {
        Version {
            version_id,
            entity_id: snapshot.entity_id.clone(),
            values,
            is_active: snapshot.is_active,
            effective_from: snapshot.effective_from,
            is_current: true,
            is_deleted: snapshot.is_deleted,
            sequence_number: existing_versions as i64 + 1,
            processed_at: self.processed_at,
            run_id: self.run_id,
        }
    }
}
