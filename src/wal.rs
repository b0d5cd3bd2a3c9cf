//! Write-ahead journal: record framing, the append path, and recovery.

pub mod record;
pub mod recovery;
pub mod writer;

pub use record::{Blob, Payload, Record, RecordKind};
pub use recovery::{recover, RecoveryStats};
pub use writer::Wal;
