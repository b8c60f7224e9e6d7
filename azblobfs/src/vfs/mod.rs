//! VFS layer (virtual filesystem)
//!
//! Turns POSIX-style path operations into cache lookups, handle-buffer
//! updates and, where remote state must change, calls on the blob backend.
//!
//! Submodules:
//! - `fs`: the `BlobFs` driver
//! - `handles`: open-file buffers and the dirty/generation bookkeeping
//! - `error`: `FsError` and its errno mapping
//! - `config`: driver tunables
pub mod config;
pub mod error;
pub mod fs;
pub mod handles;
