// Distributed locking over the shards' own storage.
//
// Locks are rows in each shard's `distributed_lock` table; no external
// coordination service is involved. A multi-shard lock is the union of
// per-shard rows for the same resource and is considered held while at least
// one component row is held.

pub mod manager;

pub use manager::{DistributedLockManager, LockInfo};
