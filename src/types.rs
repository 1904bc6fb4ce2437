// Core coordinator types and domain models.
//
// This module defines the fundamental types shared across all coordinator
// subsystems: shard identity, isolation levels, SQL parameter values, row
// representation, and the shard topology with its partition-routing seam.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a shard (1..N; `0` is reserved for the checkpoint mutex row).
pub type ShardId = u32;

/// Isolation level for shard sessions.
///
/// Passed through to the shard as the session isolation; the coordinator
/// imposes no additional interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Allows dirty reads (uncommitted data visible).
    ReadUncommitted,
    /// Only committed data is visible.
    ReadCommitted,
    /// Repeated reads return the same result within a transaction.
    RepeatableRead,
    /// Transactions appear to execute serially.
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl IsolationLevel {
    /// Parses the short config spelling (RU/RC/RR/SER).
    pub fn from_short(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RU" => Some(IsolationLevel::ReadUncommitted),
            "RC" => Some(IsolationLevel::ReadCommitted),
            "RR" => Some(IsolationLevel::RepeatableRead),
            "SER" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// A SQL parameter or result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Null,
}

impl Value {
    /// Returns the integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string value, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the timestamp value, if this is a `Timestamp`.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Null => write!(f, "NULL"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// A result row: ordered column name → value map.
pub type Row = BTreeMap<String, Value>;

/// Builds a row from `(column, value)` pairs.
pub fn row(pairs: Vec<(&str, Value)>) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Routes a partition key to its natural partition shard.
pub trait ShardRouter: Send + Sync {
    fn shard_for_key(&self, key: i64) -> ShardId;
}

/// Default even/odd partition routing.
#[derive(Debug, Clone)]
pub struct EvenOddRouter {
    pub even: ShardId,
    pub odd: ShardId,
}

impl ShardRouter for EvenOddRouter {
    fn shard_for_key(&self, key: i64) -> ShardId {
        if key.rem_euclid(2) == 0 {
            self.even
        } else {
            self.odd
        }
    }
}

/// Shard topology: the full shard set, the central shard, and the routing
/// function for partition keys.
///
/// The central shard holds every row and is authoritative for full-table
/// scans; each partition shard holds only the rows its routing predicate
/// selects.
#[derive(Clone)]
pub struct Topology {
    central: ShardId,
    shards: Vec<ShardId>,
    router: Arc<dyn ShardRouter>,
}

impl Topology {
    pub fn new(central: ShardId, shards: Vec<ShardId>, router: Arc<dyn ShardRouter>) -> Self {
        Self {
            central,
            shards,
            router,
        }
    }

    /// Three-shard layout with even keys on shard 2 and odd keys on shard 3.
    pub fn default_three_shard() -> Self {
        Self::new(1, vec![1, 2, 3], Arc::new(EvenOddRouter { even: 2, odd: 3 }))
    }

    pub fn central(&self) -> ShardId {
        self.central
    }

    /// All shards, central included, in fixed order.
    pub fn all_shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Partition shards (every shard except the central one).
    pub fn partitions(&self) -> Vec<ShardId> {
        self.shards
            .iter()
            .copied()
            .filter(|s| *s != self.central)
            .collect()
    }

    /// The natural partition shard for a routing key.
    pub fn natural_partition(&self, key: i64) -> ShardId {
        self.router.shard_for_key(key)
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.shards.contains(&shard)
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("central", &self.central)
            .field("shards", &self.shards)
            .finish()
    }
}
