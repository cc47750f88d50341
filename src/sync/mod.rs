// Streaming Sync Module
//
// Handles:
// - The stream message protocol (records, logs, state, deletes, transactions)
// - Sinks that collect messages in arrival order
// - Transaction grouping and materialization
// - Checkpoint persistence
// - The per-invocation sync state machine

pub mod engine;
pub mod protocol;
pub mod sink;
pub mod state;
pub mod transaction;

pub use engine::{SourceExtension, StreamSelection, StreamSelector, SyncEngine, SyncReport, SyncRequest};
pub use protocol::{DataRecord, DeleteRecords, Granularity, LogLevel, Message};
pub use sink::{MessageSink, PartitionedSink, StreamSink};
pub use state::{CheckpointState, JsonFileStateStore, StateStore};
pub use transaction::{materialize, MaterializedTable, Transaction};
