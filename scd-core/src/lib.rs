// Same pattern as the rest of the workspace: modules are private, and the parts that make up the
// public API are re-exported here

// Types
mod types;
pub use types::Anomaly;
pub use types::AnomalyKind;
pub use types::Classification;
pub use types::Demotion;
pub use types::MergeOutcome;
pub use types::MergePlan;
pub use types::NormalizedSnapshot;
pub use types::OrderKey;
pub use types::Promotion;
pub use types::QuarantinedRecord;
pub use types::Resequence;
pub use types::RunRecord;
pub use types::Snapshot;
pub use types::TableStats;
pub use types::Version;

// Errors
mod error;
// Per-record problems, never fatal to a run
pub use error::ValidationError;
pub use error::ConfigError;
// History store failures, split into transient (retryable) and fatal
pub use error::StoreError;
pub use error::EngineError;

// Config
mod config;
pub use config::parse_allow_lists;
pub use config::AllowLists;
pub use config::EngineConfig;
pub use config::IntegrityPolicy;
pub use config::PoolConfig;
pub use config::PostDeletionPolicy;
pub use config::TrackedAttributes;
pub use config::ValidationPolicy;

// The pipeline stages, pure functions over one entity's history
mod build;
mod detect;
mod history;
mod normalize;
mod plan;
mod reconcile;
pub use build::validate;
pub use build::version_id;
pub use build::Validated;
pub use build::VersionBuilder;
pub use detect::ChangeDetector;
pub use detect::Detection;
pub use history::EntityHistory;
pub use normalize::normalize_value;
pub use plan::EntityPlan;
pub use plan::Planner;
pub use reconcile::reconcile;
pub use reconcile::Reconciliation;

// Storage
mod memory;
mod pg;
mod source;
mod store;
pub use memory::InMemoryHistoryStore;
pub use pg::run_migrations;
pub use pg::PgHistoryStore;
pub use source::PgSnapshotSource;
pub use source::SnapshotSource;
pub use source::SourceCursor;
pub use source::StagedBatch;
pub use store::HistoryStore;

// Merge, audit and reporting
mod engine;
mod integrity;
mod merge;
mod quality;
mod report;
pub use engine::ScdEngine;
pub use integrity::AuditScope;
pub use integrity::IntegrityValidator;
pub use integrity::IntegrityViolation;
pub use integrity::Invariant;
pub use merge::MergeExecutor;
pub use quality::freshness;
pub use quality::Coverage;
pub use quality::Freshness;
pub use report::RunReport;

pub mod metrics_consts;
