use crate::history::EntityHistory;
use crate::types::{Demotion, Promotion, Resequence, Version};

/// Everything the reconciler decided for one entity. `inserts` carry their final currency flag
/// and sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub inserts: Vec<Version>,
    pub demotions: Vec<Demotion>,
    pub promotions: Vec<Promotion>,
    pub resequences: Vec<Resequence>,
    pub current: Option<String>,
}

/// Settles currency and sequence numbers across the full history of an entity, stored and newly
/// planned versions alike. The newest version is the only candidate for current, and a deleted
/// newest version means nothing is current.
pub fn reconcile(history: EntityHistory) -> Reconciliation {
    let entity_id = history.entity_id().to_string();
    let current = history
        .last()
        .filter(|v| !v.is_deleted)
        .map(|v| v.version_id.clone());

    let mut reconciliation = Reconciliation {
        current: current.clone(),
        ..Default::default()
    };

    let pending: Vec<bool> = history
        .versions()
        .iter()
        .map(|v| history.is_pending(&v.version_id))
        .collect();

    for (idx, (mut version, is_pending)) in history
        .into_versions()
        .into_iter()
        .zip(pending)
        .enumerate()
    {
        let sequence_number = idx as i64 + 1;
        let is_winner = current.as_deref() == Some(version.version_id.as_str());

        if is_pending {
            version.is_current = is_winner;
            version.sequence_number = sequence_number;
            reconciliation.inserts.push(version);
            continue;
        }

        // Any current flag other than the winner's goes, including ones left behind by drift
        if version.is_current && !is_winner {
            reconciliation.demotions.push(Demotion {
                entity_id: entity_id.clone(),
                version_id: version.version_id.clone(),
            });
        }
        if !version.is_current && is_winner {
            reconciliation.promotions.push(Promotion {
                entity_id: entity_id.clone(),
                version_id: version.version_id.clone(),
            });
        }
        if version.sequence_number != sequence_number {
            reconciliation.resequences.push(Resequence {
                entity_id: entity_id.clone(),
                version_id: version.version_id,
                sequence_number,
            });
        }
    }

    reconciliation
}
