use chrono::{DateTime, Utc};

use crate::build::version_id;
use crate::history::EntityHistory;
use crate::types::{AnomalyKind, Classification, NormalizedSnapshot};

/// The outcome of comparing one snapshot against an entity's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    // Nothing to write
    Unchanged,
    // A version must be created. `late` versions slot in before existing history and are never
    // made current.
    New {
        classification: Classification,
        late: bool,
        values: Vec<Option<String>>,
        version_id: String,
    },
    // Nothing is written, but the record is worth reporting
    Anomaly { kind: AnomalyKind, detail: String },
    // A live snapshot following a deletion. What happens to it is a policy decision.
    PostDeletion { deleted_at: DateTime<Utc> },
}

/// Stateless, pure classification of snapshots. Everything it needs is in the entity's history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn detect(&self, history: &EntityHistory, snapshot: &NormalizedSnapshot) -> Detection {
        let baseline = history.baseline(snapshot.effective_from);

        // A deletion usually carries no attributes; it closes out whatever state was in effect
        let values = match (snapshot.is_deleted, baseline) {
            (true, Some(baseline)) => snapshot
                .values
                .iter()
                .zip(baseline.values.iter())
                .map(|(new, old)| new.clone().or_else(|| old.clone()))
                .collect(),
            _ => snapshot.values.clone(),
        };

        let id = version_id(
            &snapshot.entity_id,
            snapshot.effective_from,
            &values,
            snapshot.is_deleted,
        );

        // Replays of something we already hold
        if history.contains(&id) {
            return Detection::Unchanged;
        }

        let key = (snapshot.effective_from, snapshot.is_deleted, id.as_str());
        let predecessor = history.predecessor(key);
        let successor = history.successor(key);

        if let Some(predecessor) = predecessor {
            if predecessor.is_deleted {
                if snapshot.is_deleted {
                    return Detection::Unchanged;
                }
                return Detection::PostDeletion {
                    deleted_at: predecessor.effective_from,
                };
            }
            if predecessor.same_state(&values, snapshot.is_deleted) {
                return Detection::Unchanged;
            }
        }

        if let Some(successor) = successor {
            if snapshot.is_deleted {
                return Detection::Anomaly {
                    kind: AnomalyKind::DeletionBeforeHistory,
                    detail: format!(
                        "deletion at {} precedes version {} at {}",
                        snapshot.effective_from, successor.version_id, successor.effective_from
                    ),
                };
            }
            if successor.same_state(&values, snapshot.is_deleted) {
                return Detection::Anomaly {
                    kind: AnomalyKind::SupersededBySuccessor,
                    detail: format!(
                        "snapshot at {} matches the following version {} at {}",
                        snapshot.effective_from, successor.version_id, successor.effective_from
                    ),
                };
            }
            return Detection::New {
                classification: Classification::Changed,
                late: true,
                values,
                version_id: id,
            };
        }

        let classification = if history.is_empty() {
            Classification::First
        } else {
            Classification::Changed
        };
        Detection::New {
            classification,
            late: false,
            values,
            version_id: id,
        }
    }
}

// When intermediate changes aren't retained, only the final state of each entity in the batch
// matters: the greatest effective_from, with later input position winning ties.
pub fn collapse(mut snapshots: Vec<NormalizedSnapshot>) -> Option<NormalizedSnapshot> {
    snapshots.sort_by_key(|s| (s.effective_from, s.position));
    snapshots.pop()
}

// Order in which retained snapshots are evaluated
pub fn in_effective_order(mut snapshots: Vec<NormalizedSnapshot>) -> Vec<NormalizedSnapshot> {
    snapshots.sort_by_key(|s| (s.effective_from, s.position));
    snapshots
}
