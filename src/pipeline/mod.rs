// Write/replicate pipeline and read reconstruction.
//
// Writes follow strict two-phase locking: every lock is taken before the
// primary statement executes, and all locks are released only after commit
// and replication (or on abort). Reads pick the minimum set of live shards
// and reconstruct the authoritative view when the central shard is down.

pub mod reader;
pub mod writer;

pub use reader::{ReadReconstructor, ReadResult};
pub use writer::{
    ActiveWrite, IdAllocation, TxnHandle, WritePipeline, WriteRequest, WriteResult, WriteStatement,
};
