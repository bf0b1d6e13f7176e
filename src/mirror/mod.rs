// ABOUTME: Watermark-based table mirroring from one PostgreSQL database to another
// ABOUTME: Append-only: rows are copied once, in primary-key order, and never updated or deleted

pub mod daemon;
pub mod events;
pub mod persistence;
pub mod reader;
pub mod state;
pub mod value;
pub mod worker;
pub mod writer;

pub use daemon::{Mirror, MirrorConfig, MirrorHandle};
pub use events::{EventReporter, EventStream, SyncEvent};
pub use persistence::PersistenceLoop;
pub use reader::{discover_tables, KeyColumn, KeyDomain, PgReader, PrimaryKey, TableSource};
pub use state::{CheckpointStore, Watermark};
pub use value::{Row, Value};
pub use worker::{PollPolicy, TableWorker, TickOutcome, WorkerConfig, WorkerState};
pub use writer::{PgWriter, TableSink};
