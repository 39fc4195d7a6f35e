//! Framehouse Server
//!
//! Pieces of the `framehouse` binary that are worth testing on their own:
//!
//! - [`config`]: the JSON configuration file and archive tier backends
//! - [`feed`]: a synthetic camera that drives the storage manager

pub mod config;
pub mod feed;

pub use config::{ArchiveBackend, ArchiveConfig, ServerConfig};
pub use feed::SyntheticCamera;
