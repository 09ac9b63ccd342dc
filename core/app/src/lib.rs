//! CalVault core service.
//!
//! Wires the credential vault, the provider adapters and the sync engine
//! into one [`CalVault`] handle for the host application: account setup
//! and removal, event reads for the widget layer, key rotation, and
//! orderly shutdown.

pub mod config;
pub mod logging;
pub mod service;

pub use config::{default_data_dir, CoreConfig};
pub use logging::init_logging;
pub use service::CalVault;
