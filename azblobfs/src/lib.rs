// Library crate for azblobfs: exposes the storage client, metadata cache,
// driver and FUSE adapter to the binary and the integration tests.

pub mod cadapter;
pub mod config;
pub mod fuse;
pub mod meta;
pub mod vfs;
