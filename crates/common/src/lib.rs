//! wgmesh common library
//!
//! Shared data model, key derivation, wire envelope, and route logic for
//! the wgmesh daemon, CLI, and centralized tooling.

pub mod envelope;
pub mod error;
pub mod keys;
pub mod mesh;
pub mod routes;
pub mod types;

// Re-export commonly used types
pub use error::{rpc_code, Error, Result};
pub use keys::{derive, DerivedKeys};
pub use types::*;

/// wgmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default persisted-state directory.
pub fn default_state_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/wgmesh")
}
