//! Calendar provider adapters for CalVault.
//!
//! This module provides a trait-based interface over calendar providers
//! (iCloud over CalDAV, Google over its REST API) and a registry for
//! resolving an account's provider to its adapter.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic in vault or sync code
//! - Adapters never touch the master key or the credential store
//! - Unified error semantics: HTTP failures map onto the shared taxonomy

pub mod adapter;
pub mod google;
pub mod http;
pub mod icloud;
pub mod memory;
pub mod registry;

pub use adapter::{EventChanges, FetchOutcome, ProviderAdapter, Refresh};
pub use google::{AuthorizationRequest, GoogleAdapter, GoogleConfig};
pub use icloud::{ICloudAdapter, ICloudConfig};
pub use memory::{MemoryAdapter, ScriptedFailure};
pub use registry::AdapterRegistry;
