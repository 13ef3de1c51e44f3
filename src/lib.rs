//! MCP Instrumenting Reverse Proxy Library
//!
//! Sits between MCP clients and an upstream server, forwards traffic
//! transparently, and emits distributed-tracing spans describing each tool
//! invocation (request and eventual result) to a telemetry ingest endpoint.

pub mod config;
pub mod proxy;
pub mod runtime;
pub mod telemetry;

pub use config::{load_config, ListenerConfig, ProxyConfig, ProxyKind};
pub use proxy::ProxyServer;
pub use runtime::ProxyRuntime;
pub use telemetry::{TelemetryClient, TelemetryClientOptions};
