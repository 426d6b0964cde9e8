use chrono::{DateTime, Utc};
use thiserror::Error;

/// Per-record validation failures. These never abort a run - depending on policy the record is
/// either quarantined or kept and flagged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("snapshot has no entity id")]
    MissingEntityId,
    #[error("snapshot for {0} has no effective_from timestamp")]
    MissingEffectiveFrom(String),
    #[error("value {value:?} is not allowed for attribute {attribute}")]
    ValueNotAllowed { attribute: String, value: String },
    #[error("entity was deleted at {deleted_at}, snapshot at {effective_from} rejected")]
    PostDeletion {
        deleted_at: DateTime<Utc>,
        effective_from: DateTime<Utc>,
    },
}

impl ValidationError {
    // Missing identity or timestamp leaves nothing to version, so those always quarantine
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ValidationError::MissingEntityId | ValidationError::MissingEffectiveFrom(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one tracked attribute is required")]
    NoTrackedAttributes,
    #[error("tracked attribute {0} is listed more than once")]
    DuplicateTrackedAttribute(String),
    #[error("{0} is not a valid policy, expected one of {1}")]
    InvalidPolicy(String, &'static str),
    #[error("could not parse allow-list entry {0:?}, expected attribute=value|value")]
    InvalidAllowList(String),
    #[error("allow-list given for {0}, which is not a tracked attribute")]
    UntrackedAllowList(String),
}

/// Errors from the history store. Transient ones (conflicts, lost connections) are safe to retry
/// because every write the engine issues is idempotent.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("{command} failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("stored row is malformed: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::MergeConflict(_) | StoreError::Unavailable(_)
        )
    }

    pub fn query(command: &str, error: sqlx::Error) -> Self {
        if is_conflict_error(&error) {
            return StoreError::MergeConflict(format!("{command}: {error}"));
        }
        if is_unavailable_error(&error) {
            return StoreError::Unavailable(format!("{command}: {error}"));
        }
        StoreError::QueryError {
            command: command.to_string(),
            error,
        }
    }
}

// 40001 serialization_failure, 40P01 deadlock_detected, 55P03 lock_not_available
// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
fn is_conflict_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => match db_error.code() {
            Some(code) => {
                let code: &str = code.as_ref();
                matches!(code, "40001" | "40P01" | "55P03")
            }
            None => {
                let msg = db_error.message().to_lowercase();
                msg.contains("deadlock") || msg.contains("serialization")
            }
        },
        _ => false,
    }
}

fn is_unavailable_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => true,
        // 08*** connection exception, 53*** insufficient resources, 57*** operator intervention
        sqlx::Error::Database(db_error) => db_error.code().is_some_and(|code| {
            let code: &str = code.as_ref();
            code.starts_with("08") || code.starts_with("53") || code.starts_with("57")
        }),
        _ => false,
    }
}

/// Run-level errors. Any of these means nothing from the run was committed.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tracked attributes changed from {stored:?} to {configured:?}, the history table must be rebuilt")]
    RebuildRequired {
        stored: Vec<String>,
        configured: Vec<String>,
    },
    #[error("merge still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("run cancelled before commit")]
    Cancelled,
    #[error("runs are halted until {0} integrity violation(s) are resolved")]
    Halted(u64),
    #[error("planning task failed: {0}")]
    Planning(String),
}
