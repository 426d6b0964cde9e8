use std::collections::HashMap;

use tracing::warn;

use crate::build::VersionBuilder;
use crate::config::{EngineConfig, PostDeletionPolicy};
use crate::detect::{collapse, in_effective_order, ChangeDetector, Detection};
use crate::error::ValidationError;
use crate::history::EntityHistory;
use crate::reconcile::{reconcile, Reconciliation};
use crate::types::{Anomaly, AnomalyKind, Classification, NormalizedSnapshot, Version};

/// Planning output for a single entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPlan {
    pub reconciliation: Reconciliation,
    pub anomalies: Vec<Anomaly>,
    // Records refused during planning, by their batch position
    pub rejected: Vec<(usize, ValidationError)>,
    pub first: u64,
    pub changed: u64,
    pub unchanged: u64,
}

/// Runs change detection, version building and reconciliation for one entity at a time. Holds no
/// state of its own, so entities can be planned in parallel.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    config: &'a EngineConfig,
    builder: VersionBuilder,
    detector: ChangeDetector,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a EngineConfig, builder: VersionBuilder) -> Self {
        Self {
            config,
            builder,
            detector: ChangeDetector,
        }
    }

    pub fn plan_entity(
        &self,
        entity_id: &str,
        snapshots: Vec<NormalizedSnapshot>,
        stored: Vec<Version>,
    ) -> EntityPlan {
        let mut history = EntityHistory::new(entity_id, stored);
        let mut plan = EntityPlan::default();

        let snapshots = if self.config.retain_intermediate_changes {
            in_effective_order(snapshots)
        } else {
            collapse(snapshots).into_iter().collect()
        };

        for snapshot in snapshots {
            match self.detector.detect(&history, &snapshot) {
                Detection::Unchanged => plan.unchanged += 1,
                Detection::New {
                    classification,
                    late,
                    values,
                    version_id,
                } => {
                    match classification {
                        Classification::First => plan.first += 1,
                        _ => plan.changed += 1,
                    }
                    if late {
                        warn!(
                            entity_id,
                            effective_from = %snapshot.effective_from,
                            "late snapshot inserted as history"
                        );
                        plan.anomalies.push(Anomaly {
                            entity_id: entity_id.to_string(),
                            effective_from: snapshot.effective_from,
                            kind: AnomalyKind::LateArrival,
                            detail: format!("version {version_id} inserted behind newer history"),
                        });
                    }
                    let version =
                        self.builder
                            .build(&snapshot, values, version_id, history.len());
                    history.insert_pending(version);
                }
                Detection::Anomaly { kind, detail } => {
                    warn!(entity_id, effective_from = %snapshot.effective_from, %kind, "{detail}");
                    plan.anomalies.push(Anomaly {
                        entity_id: entity_id.to_string(),
                        effective_from: snapshot.effective_from,
                        kind,
                        detail,
                    });
                }
                Detection::PostDeletion { deleted_at } => {
                    warn!(
                        entity_id,
                        effective_from = %snapshot.effective_from,
                        %deleted_at,
                        "snapshot for deleted entity"
                    );
                    plan.anomalies.push(Anomaly {
                        entity_id: entity_id.to_string(),
                        effective_from: snapshot.effective_from,
                        kind: AnomalyKind::PostDeletion,
                        detail: format!("entity deleted at {deleted_at}"),
                    });
                    if self.config.on_post_deletion_snapshot == PostDeletionPolicy::Reject {
                        plan.rejected.push((
                            snapshot.position,
                            ValidationError::PostDeletion {
                                deleted_at,
                                effective_from: snapshot.effective_from,
                            },
                        ));
                    }
                }
            }
        }

        // Entities with nothing new are left alone
        if history.has_pending() {
            plan.reconciliation = reconcile(history);
        }
        plan
    }

    // Plans a group of entities. Histories missing from `stored` are treated as empty.
    pub fn plan_all(
        &self,
        groups: HashMap<String, Vec<NormalizedSnapshot>>,
        mut stored: HashMap<String, Vec<Version>>,
    ) -> Vec<EntityPlan> {
        use rayon::prelude::*;

        let work: Vec<_> = groups
            .into_iter()
            .map(|(entity_id, snapshots)| {
                let history = stored.remove(&entity_id).unwrap_or_default();
                (entity_id, snapshots, history)
            })
            .collect();

        work.into_par_iter()
            .map(|(entity_id, snapshots, history)| {
                self.plan_entity(&entity_id, snapshots, history)
            })
            .collect()
    }
}
