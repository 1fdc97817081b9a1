//! User ID resolution for header bidding auctions.
//!
//! Resolves privacy-relevant user identifiers from pluggable identity
//! submodules, caches them in cookie or local storage, and attaches the merged
//! identifiers to every bid of an auction before it is dispatched.
//!
//! # Modules
//!
//! - [`config`]: Processing of the raw `usersync` configuration
//! - [`consent`]: Opt-out markers and GDPR consent signals
//! - [`constants`]: Storage keys, limits and log prefix
//! - [`engine`]: The resolution engine and its lifecycle
//! - [`error`]: Error types and error handling utilities
//! - [`hook`]: Bid request types and the decoration hook
//! - [`logging`]: Logger initialization
//! - [`registry`]: Submodule contract and registry
//! - [`settings`]: File and environment based settings
//! - [`storage`]: Cookie and local storage backends
//! - [`submodules`]: Built-in identity submodules
//! - [`test_support`]: Testing utilities and mocks

pub mod config;
pub mod consent;
pub mod constants;
pub mod engine;
pub mod error;
pub mod hook;
pub mod logging;
pub mod registry;
pub mod settings;
pub mod storage;
pub mod submodules;

pub use consent::ConsentData;
pub use engine::{EngineStatus, UserIdEngine};
pub use error::UserIdError;
pub use hook::{decorate_ad_units, AdUnit, BidRequest, BidSpec};
pub use registry::{IdResult, IdSubmodule, IdentifierMap, SubmoduleRegistry};
pub use settings::Settings;
pub use storage::{MemoryStorage, StorageBackend, StorageKind};
