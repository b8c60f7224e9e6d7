//! Blob storage adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `BlobBackend` seam and the storage error taxonomy
//! - `signer`: SharedKey canonicalization and HMAC signing
//! - `listing`: list XML parsing and the marker-driven `BlobPager`
//! - `azure`: signed HTTP implementation of `BlobBackend`
//! - `memory`: in-process implementation used by tests and `--backend memory`
//!
pub mod azure;
pub mod client;
pub mod listing;
pub mod memory;
pub mod signer;
