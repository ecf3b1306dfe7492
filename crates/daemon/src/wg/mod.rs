//! WireGuard interface control
//!
//! Everything the daemon does to the kernel happens here: interface
//! creation, address assignment, `wg` configuration diff/apply, and route
//! reconciliation. All subprocess work goes through [`crate::exec`].

pub mod driver;
pub mod platform;
pub mod routes;

pub use driver::{WgConfig, WgDiff, WgDriver, WgPeer};
pub use platform::{InterfaceManager, Platform};
pub use routes::RouteReconciler;
