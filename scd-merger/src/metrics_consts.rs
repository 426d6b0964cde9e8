pub const BATCHES_READ: &str = "scd_merger_batches_read";
pub const SNAPSHOTS_READ: &str = "scd_merger_snapshots_read";
pub const EMPTY_POLLS: &str = "scd_merger_empty_polls";
pub const LOOP_ERRORS: &str = "scd_merger_loop_errors";
pub const STALE: &str = "scd_merger_table_stale";
