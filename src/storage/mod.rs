pub mod checkpoint;
pub mod index;
pub mod record;
pub mod recovery;
pub mod wal;

pub use index::MemIndex;
pub use record::{Record, RecordKind};
pub use recovery::{recover, Recovered};
pub use wal::Wal;
