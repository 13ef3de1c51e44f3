//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON)
//!     → loader.rs (parse, coerce ports, default listener names)
//!     → ProxyConfig (immutable mapping name → listener)
//!     → runtime applies it: close all listeners, start one per entry
//!
//! On reload signal:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → valid: sent to the runtime for apply
//!     → invalid: logged, previous listeners keep running
//! ```

pub mod loader;
pub mod schema;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{ListenerConfig, ProxyConfig, ProxyKind};
pub use watcher::watch_config;
