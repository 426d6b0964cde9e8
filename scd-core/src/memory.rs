use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::TrackedAttributes;
use crate::error::StoreError;
use crate::store::HistoryStore;
use crate::types::{MergeOutcome, MergePlan, QuarantinedRecord, RunRecord, TableStats, Version};

#[derive(Debug, Default)]
struct State {
    attributes: Option<TrackedAttributes>,
    versions: HashMap<String, Vec<Version>>,
    version_ids: HashSet<String>,
    runs: Vec<RunRecord>,
    quarantine: Vec<QuarantinedRecord>,
    // Failure injection and read tracking, for tests
    failing_applies: u32,
    fetched: Vec<Vec<String>>,
}

/// History store held in memory. Applies are atomic under the state lock.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` applies fail with a merge conflict, without touching state.
    pub async fn fail_next_applies(&self, count: u32) {
        self.state.lock().await.failing_applies = count;
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.state.lock().await.quarantine.clone()
    }

    /// The entity ids requested by every `fetch_histories` call so far.
    pub async fn fetched(&self) -> Vec<Vec<String>> {
        self.state.lock().await.fetched.clone()
    }

    /// Overwrite a stored version in place. Lets tests simulate out-of-band edits.
    pub async fn tamper<F>(&self, entity_id: &str, version_id: &str, edit: F)
    where
        F: FnOnce(&mut Version) + Send,
    {
        let mut state = self.state.lock().await;
        if let Some(version) = state
            .versions
            .get_mut(entity_id)
            .and_then(|vs| vs.iter_mut().find(|v| v.version_id == version_id))
        {
            edit(version);
        }
    }
}

fn find<'a>(
    versions: &'a mut HashMap<String, Vec<Version>>,
    entity_id: &str,
    version_id: &str,
) -> Option<&'a mut Version> {
    versions
        .get_mut(entity_id)?
        .iter_mut()
        .find(|v| v.version_id == version_id)
}

fn sorted(mut versions: Vec<Version>) -> Vec<Version> {
    versions.sort_by(|a, b| {
        (a.entity_id.as_str(), a.sequence_number).cmp(&(b.entity_id.as_str(), b.sequence_number))
    });
    versions
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn tracked_attributes(&self) -> Result<Option<TrackedAttributes>, StoreError> {
        Ok(self.state.lock().await.attributes.clone())
    }

    async fn initialize(&self, attributes: &TrackedAttributes) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.attributes.is_none() {
            state.attributes = Some(attributes.clone());
        }
        Ok(())
    }

    async fn fetch_histories(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, Vec<Version>>, StoreError> {
        let mut state = self.state.lock().await;
        state.fetched.push(entity_ids.to_vec());
        Ok(entity_ids
            .iter()
            .filter_map(|id| state.versions.get(id).map(|vs| (id.clone(), vs.clone())))
            .collect())
    }

    async fn apply(&self, plan: &MergePlan) -> Result<MergeOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if state.failing_applies > 0 {
            state.failing_applies -= 1;
            return Err(StoreError::MergeConflict(
                "injected conflict".to_string(),
            ));
        }

        // Check every referenced version exists before changing anything
        let pending: HashSet<&str> = plan.inserts.iter().map(|v| v.version_id.as_str()).collect();
        let references = plan
            .demotions
            .iter()
            .map(|d| (&d.entity_id, &d.version_id))
            .chain(plan.promotions.iter().map(|p| (&p.entity_id, &p.version_id)))
            .chain(plan.resequences.iter().map(|r| (&r.entity_id, &r.version_id)));
        for (entity_id, version_id) in references {
            let known = state
                .versions
                .get(entity_id)
                .is_some_and(|vs| vs.iter().any(|v| &v.version_id == version_id));
            if !known && !pending.contains(version_id.as_str()) {
                return Err(StoreError::Malformed(format!(
                    "plan references unknown version {version_id} of {entity_id}"
                )));
            }
        }

        let mut outcome = MergeOutcome::default();
        let state = &mut *state;

        for version in &plan.inserts {
            if !state.version_ids.insert(version.version_id.clone()) {
                continue;
            }
            state
                .versions
                .entry(version.entity_id.clone())
                .or_default()
                .push(version.clone());
            outcome.inserted += 1;
        }

        for demotion in &plan.demotions {
            if let Some(v) = find(&mut state.versions, &demotion.entity_id, &demotion.version_id) {
                if v.is_current {
                    v.is_current = false;
                    outcome.demoted += 1;
                }
            }
        }

        for promotion in &plan.promotions {
            if let Some(v) = find(&mut state.versions, &promotion.entity_id, &promotion.version_id)
            {
                if !v.is_current {
                    v.is_current = true;
                    outcome.promoted += 1;
                }
            }
        }

        for reseq in &plan.resequences {
            if let Some(v) = find(&mut state.versions, &reseq.entity_id, &reseq.version_id) {
                if v.sequence_number != reseq.sequence_number {
                    v.sequence_number = reseq.sequence_number;
                    outcome.resequenced += 1;
                }
            }
        }

        // Lineage is written once per run, even if the plan is applied again
        if !state.runs.iter().any(|r| r.run_id == plan.run.run_id) {
            state.runs.push(plan.run.clone());
            state.quarantine.extend(plan.quarantined.iter().cloned());
        }

        Ok(outcome)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .values()
            .flatten()
            .filter(|v| v.is_current || v.is_deleted)
            .map(|v| v.effective_from)
            .max())
    }

    async fn current_state(&self) -> Result<Vec<Version>, StoreError> {
        let state = self.state.lock().await;
        Ok(sorted(
            state
                .versions
                .values()
                .flatten()
                .filter(|v| v.is_current && !v.is_deleted)
                .cloned()
                .collect(),
        ))
    }

    async fn history(&self, entity_id: &str) -> Result<Vec<Version>, StoreError> {
        let state = self.state.lock().await;
        Ok(sorted(
            state.versions.get(entity_id).cloned().unwrap_or_default(),
        ))
    }

    async fn all_versions(&self) -> Result<Vec<Version>, StoreError> {
        let state = self.state.lock().await;
        Ok(sorted(state.versions.values().flatten().cloned().collect()))
    }

    async fn stats(&self) -> Result<TableStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = TableStats {
            entities: state.versions.len() as u64,
            ..Default::default()
        };
        for v in state.versions.values().flatten() {
            stats.total_versions += 1;
            if v.is_current {
                stats.current_versions += 1;
            }
            if v.is_deleted {
                stats.deleted_versions += 1;
            }
        }
        Ok(stats)
    }
}
