//! Client-resident side of flag delivery: bootstrap from a local snapshot, then keep flags
//! current over push or polling.
pub mod errors;
pub mod snapshot;
pub mod sticky;
pub mod sync;
pub mod timer;
pub mod transport;

pub use errors::{ClientError, TransportError};
pub use snapshot::{ClientSnapshot, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use sync::{ClientConfig, ClientSync, FlagsView, RefreshMode, SyncPhase, Visibility};
pub use transport::{FlagTransport, HttpTransport};
