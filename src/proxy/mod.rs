//! Proxy core subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → server.rs (trace context, forwarding)
//!     → identity.rs (session / connection keys)
//!     → rpc.rs (tool-call detection in request bodies)
//!     → inflight.rs (register pending call, INTERNAL request span)
//!     → upstream
//! upstream response
//!     → decode.rs (SSE frames / compressed buffered bodies)
//!     → rpc.rs (tool-result detection)
//!     → inflight.rs (match, dedup, SERVER result span)
//!     → sweep task (timeout ERROR spans)
//! websocket upgrade
//!     → websocket.rs (frame passthrough, no correlation)
//! ```

pub mod decode;
pub mod identity;
pub mod inflight;
pub mod rpc;
pub mod server;
pub mod websocket;

pub use inflight::{InflightTable, InflightToolCall, Resolution};
pub use server::{spawn_sweeper, AppState, ProxyServer};
