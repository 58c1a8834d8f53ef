//! Engine configuration.

use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period of the status reconciliation sweep.
    pub reconcile_interval: Duration,

    /// Period of the run counter synchronization.
    pub counter_sync_interval: Duration,

    /// Period of the task cache refresh.
    pub cache_refresh_interval: Duration,

    /// Cluster-wide lock guarding the reconciliation sweep.
    pub reconcile_lock_key: String,
    pub reconcile_lock_ttl: Duration,

    /// Cluster-wide lock guarding the counter synchronization.
    pub counter_sync_lock_key: String,
    pub counter_sync_lock_ttl: Duration,

    /// Page size used when listing tasks from the repository.
    pub task_page_size: usize,

    /// Number of runs synced per counter batch.
    pub counter_sync_batch_size: usize,

    /// How far back the counter sync looks for recently finished tasks.
    pub recent_terminal_window: Duration,

    /// Page size of historical span queries during backfill.
    pub backfill_page_size: usize,

    /// Pages buffered between the backfill pager and flush consumer.
    pub backfill_queue_capacity: usize,

    pub backfill_lock_ttl: Duration,

    /// Upper bound on how long one replica may hold a backfill lock.
    pub backfill_lock_max_hold: Duration,

    /// Deadline of one backfill invocation.
    pub backfill_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_interval: 5 * MINUTE,
            counter_sync_interval: 2 * MINUTE,
            cache_refresh_interval: MINUTE,
            reconcile_lock_key: "observability:task:check_task_status".to_string(),
            reconcile_lock_ttl: 3 * MINUTE,
            counter_sync_lock_key: "observability:task:sync_task_run_count".to_string(),
            counter_sync_lock_ttl: 3 * MINUTE,
            task_page_size: 500,
            counter_sync_batch_size: 50,
            recent_terminal_window: 24 * HOUR,
            backfill_page_size: 500,
            backfill_queue_capacity: 4,
            backfill_lock_ttl: 3 * MINUTE,
            backfill_lock_max_hold: 24 * HOUR,
            backfill_timeout: 24 * HOUR,
        }
    }
}

/// Lock key serializing backfills of one task across replicas.
pub fn backfill_lock_key(task_id: &tracehub_core::TaskId) -> String {
    format!("observability:tracehub:backfill:{task_id}")
}
