// SQL statements issued against the coordinator-owned tables.
//
// Every statement the coordinator runs against `distributed_lock`,
// `recovery_log`, and `recovery_checkpoints` lives here as a parameterized
// template. Centralizing them keeps the wire surface auditable and lets
// backends dispatch on the exact template. Domain SQL for the `trans` table
// is opaque to the coordinator and never appears here.

/// Trivial liveness probe.
pub const PING: &str = "SELECT 1";

// ---------------------------------------------------------------------------
// distributed_lock
// ---------------------------------------------------------------------------

/// Lock row lookup inside the acquisition transaction. Params: lock_name.
pub const SELECT_LOCK_FOR_UPDATE: &str =
    "SELECT lock_name, holder_id, lock_time FROM distributed_lock WHERE lock_name = ? FOR UPDATE";

/// Plain lock row lookup for diagnostics. Params: lock_name.
pub const SELECT_LOCK: &str =
    "SELECT lock_name, holder_id, lock_time FROM distributed_lock WHERE lock_name = ?";

/// Lock claim. Params: lock_name, holder_id.
pub const INSERT_LOCK: &str =
    "INSERT INTO distributed_lock (lock_name, holder_id) VALUES (?, ?)";

/// Targeted delete, used both for release (own holder) and stale takeover
/// (observed holder). Params: lock_name, holder_id.
pub const DELETE_LOCK: &str =
    "DELETE FROM distributed_lock WHERE lock_name = ? AND holder_id = ?";

/// Session-wide cleanup. Params: holder_id.
pub const DELETE_LOCKS_BY_HOLDER: &str = "DELETE FROM distributed_lock WHERE holder_id = ?";

/// Administrative stale sweep. Params: cutoff timestamp.
pub const DELETE_LOCKS_OLDER_THAN: &str = "DELETE FROM distributed_lock WHERE lock_time < ?";

// ---------------------------------------------------------------------------
// recovery_log
// ---------------------------------------------------------------------------

/// Dedup probe within the hash window. Params: transaction_hash.
pub const COUNT_RECOVERY_BY_HASH: &str =
    "SELECT COUNT(*) AS n FROM recovery_log WHERE transaction_hash = ? AND status IN ('PENDING', 'COMPLETED')";

/// Primary log append. Params: target_node, source_node, sql_statement,
/// transaction_hash.
pub const INSERT_RECOVERY: &str =
    "INSERT INTO recovery_log (target_node, source_node, sql_statement, transaction_hash) VALUES (?, ?, ?, ?)";

/// Cross-backup append; the error_message column carries the backup marker.
/// Params: target_node, source_node, sql_statement, transaction_hash,
/// error_message.
pub const INSERT_RECOVERY_BACKUP: &str =
    "INSERT INTO recovery_log (target_node, source_node, sql_statement, transaction_hash, error_message) VALUES (?, ?, ?, ?, ?)";

/// Quick-skip probe before a drain cycle.
pub const COUNT_PENDING: &str = "SELECT COUNT(*) AS n FROM recovery_log WHERE status = 'PENDING'";

/// Pending entries past the checkpoint, in replay order. Params: checkpoint.
pub const SELECT_PENDING_SINCE: &str =
    "SELECT log_id, target_node, source_node, sql_statement, transaction_hash, timestamp, status, retry_count, error_message FROM recovery_log WHERE log_id > ? AND status = 'PENDING' ORDER BY log_id ASC";

/// Terminal status update. Params: status, error_message, log_id.
pub const UPDATE_RECOVERY_STATUS: &str =
    "UPDATE recovery_log SET status = ?, error_message = ? WHERE log_id = ?";

/// Failed-attempt bookkeeping. Params: error_message, log_id.
pub const UPDATE_RECOVERY_RETRY: &str =
    "UPDATE recovery_log SET retry_count = retry_count + 1, error_message = ? WHERE log_id = ?";

/// Out-of-band repair of terminally failed entries.
pub const RESET_FAILED: &str =
    "UPDATE recovery_log SET status = 'PENDING', retry_count = 0, error_message = NULL WHERE status = 'FAILED'";

/// Per-shard status rollup.
pub const STATUS_SUMMARY: &str =
    "SELECT status, COUNT(*) AS n FROM recovery_log GROUP BY status";

// ---------------------------------------------------------------------------
// recovery_checkpoints
// ---------------------------------------------------------------------------

/// Idempotent checkpoint row creation. Params: node_id, last_processed_log_id.
pub const INIT_CHECKPOINT: &str =
    "INSERT IGNORE INTO recovery_checkpoints (node_id, last_processed_log_id) VALUES (?, ?)";

/// Advisory mutex claim: exactly one caller observes rowcount 1.
/// Params: pid.
pub const CLAIM_RECOVERY_MUTEX: &str =
    "UPDATE recovery_checkpoints SET last_processed_log_id = ? WHERE node_id = 0 AND last_processed_log_id = -1";

/// Mutex release, guarded so only the holder can free it. Params: pid.
pub const RELEASE_RECOVERY_MUTEX: &str =
    "UPDATE recovery_checkpoints SET last_processed_log_id = -1 WHERE node_id = 0 AND last_processed_log_id = ?";

/// Operator escape hatch for a wedged mutex.
pub const FORCE_RELEASE_RECOVERY_MUTEX: &str =
    "UPDATE recovery_checkpoints SET last_processed_log_id = -1 WHERE node_id = 0";

/// All real-shard watermarks.
pub const SELECT_CHECKPOINTS: &str =
    "SELECT node_id, last_processed_log_id FROM recovery_checkpoints WHERE node_id > 0 ORDER BY node_id";

/// Watermark advance; the guard enforces monotonic non-decrease.
/// Params: value, node_id, value.
pub const ADVANCE_CHECKPOINT: &str =
    "UPDATE recovery_checkpoints SET last_processed_log_id = ? WHERE node_id = ? AND last_processed_log_id < ?";

// ---------------------------------------------------------------------------
// trans (the only domain statement the coordinator itself issues)
// ---------------------------------------------------------------------------

/// Max-primary-key scan for insert id allocation.
pub const SELECT_MAX_TRANS_ID: &str = "SELECT MAX(trans_id) AS max_id FROM trans";
