use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_values;
use crate::types::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    // A live entity has exactly one current version, a deleted one has none
    CurrentUniqueness,
    DeletedCurrent,
    // The current version isn't the newest one
    StaleCurrent,
    // Sequence numbers disagree with effective order
    Ordering,
    // A live version repeats the live version before it
    NoOpVersion,
    SequenceGap,
    DuplicateVersionId,
    // A live version follows a deletion
    DeletionNotTerminal,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Invariant::CurrentUniqueness => "current_uniqueness",
            Invariant::DeletedCurrent => "deleted_current",
            Invariant::StaleCurrent => "stale_current",
            Invariant::Ordering => "ordering",
            Invariant::NoOpVersion => "no_op_version",
            Invariant::SequenceGap => "sequence_gap",
            Invariant::DuplicateVersionId => "duplicate_version_id",
            Invariant::DeletionNotTerminal => "deletion_not_terminal",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub invariant: Invariant,
    pub entity_ids: Vec<String>,
    pub description: String,
}

/// Which versions an audit covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditScope {
    Table,
    Entities(Vec<String>),
}

/// Read-only auditor. Never corrects anything, only reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityValidator;

impl IntegrityValidator {
    pub fn audit(&self, versions: &[Version]) -> Vec<IntegrityViolation> {
        let mut violations = Vec::new();

        let mut by_id: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut by_entity: BTreeMap<&str, Vec<&Version>> = BTreeMap::new();
        for v in versions {
            by_id
                .entry(v.version_id.as_str())
                .or_default()
                .push(v.entity_id.as_str());
            by_entity.entry(v.entity_id.as_str()).or_default().push(v);
        }

        let mut duplicates: Vec<_> = by_id.into_iter().filter(|(_, e)| e.len() > 1).collect();
        duplicates.sort();
        for (version_id, mut entity_ids) in duplicates {
            entity_ids.sort_unstable();
            entity_ids.dedup();
            violations.push(IntegrityViolation {
                invariant: Invariant::DuplicateVersionId,
                entity_ids: entity_ids.iter().map(|e| e.to_string()).collect(),
                description: format!("version id {version_id} appears more than once"),
            });
        }

        for (entity_id, mut history) in by_entity {
            history.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
            audit_entity(entity_id, &history, &mut violations);
        }

        violations
    }
}

fn audit_entity(entity_id: &str, history: &[&Version], violations: &mut Vec<IntegrityViolation>) {
    let mut report = |invariant: Invariant, description: String| {
        violations.push(IntegrityViolation {
            invariant,
            entity_ids: vec![entity_id.to_string()],
            description,
        });
    };

    let Some(newest) = history.last() else {
        return;
    };

    let current: Vec<&&Version> = history.iter().filter(|v| v.is_current).collect();
    let expected = usize::from(!newest.is_deleted);
    if current.len() != expected {
        report(
            Invariant::CurrentUniqueness,
            format!(
                "{} current version(s), expected {expected}",
                current.len()
            ),
        );
    }

    for v in &current {
        if v.is_deleted {
            report(
                Invariant::DeletedCurrent,
                format!("deleted version {} is current", v.version_id),
            );
        } else if v.version_id != newest.version_id {
            report(
                Invariant::StaleCurrent,
                format!(
                    "version {} is current but {} is newer",
                    v.version_id, newest.version_id
                ),
            );
        }
    }

    for pair in history.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.is_deleted && !next.is_deleted {
            report(
                Invariant::DeletionNotTerminal,
                format!(
                    "version {} follows deletion {}",
                    next.version_id, prev.version_id
                ),
            );
        }
        if !prev.is_deleted
            && !next.is_deleted
            && normalize_values(&prev.values) == normalize_values(&next.values)
        {
            report(
                Invariant::NoOpVersion,
                format!(
                    "version {} repeats the values of {}",
                    next.version_id, prev.version_id
                ),
            );
        }
    }

    // Sequence numbers must be exactly 1..=n. When they are, they must also follow effective
    // order, ties included.
    let mut sequence: Vec<i64> = history.iter().map(|v| v.sequence_number).collect();
    sequence.sort_unstable();
    if let Some((idx, seq)) = sequence
        .iter()
        .enumerate()
        .find(|(idx, seq)| **seq != *idx as i64 + 1)
    {
        report(
            Invariant::SequenceGap,
            format!("sequence number {seq} found where {} was expected", idx + 1),
        );
    } else {
        for pair in history.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if prev.sequence_number > next.sequence_number {
                report(
                    Invariant::Ordering,
                    format!(
                        "version {} has sequence number {} but is effective before {} with {}",
                        prev.version_id,
                        prev.sequence_number,
                        next.version_id,
                        next.sequence_number
                    ),
                );
            }
        }
    }
}
