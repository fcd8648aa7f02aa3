//! Shared primitives for the Callboard live queue broadcast service: the
//! two-dataset snapshot model, change fingerprints, and the frames exchanged
//! with browser sessions. Nothing in here performs I/O.

mod fingerprint;
mod protocol;
mod snapshot;

pub use fingerprint::{canonical_string, fingerprint, Fingerprint, FingerprintPair};
pub use protocol::{BroadcastEvent, ClientMessage, ServerMessage, CONNECTED_MESSAGE};
pub use snapshot::{
    check_shape, into_records, normalize_dataset, Dataset, Record, ShapeError, Snapshot,
};

/// Name of the broadcast group every browser session joins.
pub const CALLS_GROUP: &str = "calls";
