//! Content addressing for the vat kernel: the `sha256:` [`Hash`] that names
//! blobs, snapshots and spans, and deterministic CBOR for export files.

mod canonical;
mod hash;

pub use canonical::to_canonical_cbor;
pub use hash::{Hash, HashParseError};
