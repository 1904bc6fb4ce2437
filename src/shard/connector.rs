// Session and factory traits for shard access.
//
// Sessions are single-owner and never shared between tasks; the factory does
// not pool. Callers manage session lifetime: open, use, then `close` (or
// drop, which rolls back any open transaction in well-behaved backends).

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{IsolationLevel, Row, ShardId, Value};

/// A live session against one shard.
///
/// `execute` runs a statement and returns the affected row count; `query`
/// returns result rows. Statements are parameterized with `?` placeholders
/// bound in order from `params`.
#[async_trait]
pub trait ShardSession: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Opens an explicit transaction. Work between `begin` and
    /// `commit`/`rollback` is atomic on the shard.
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Releases the session. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Produces authenticated sessions to named shards.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    /// Opens a session to `shard` configured with the requested isolation
    /// level. Connect attempts are bounded by the shard's configured
    /// connect timeout.
    ///
    /// # Errors
    ///
    /// - `CoordError::InvalidShard` if the id is not part of the topology.
    /// - `CoordError::ShardUnreachable` if the shard is down or the connect
    ///   attempt timed out.
    /// - `CoordError::AuthFailed` if credentials were rejected.
    async fn connect(
        &self,
        shard: ShardId,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn ShardSession>>;

    /// All shard ids this connector can reach.
    fn shard_ids(&self) -> Vec<ShardId>;
}
