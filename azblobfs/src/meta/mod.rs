//! Metadata layer
//!
//! Submodules:
//! - `path`: path → container/blob resolution and container-name rules
//! - `cache`: container set and lazily populated per-container blob listings
pub mod cache;
pub mod path;
