//! `mcp-runtime` — a client-side runtime for the Model Context Protocol.
//!
//! This crate drives one or more MCP servers, each a child process speaking
//! line-delimited JSON-RPC 2.0 over its stdio. It covers three layers:
//!
//! - [`transport`]: spawn a child, frame JSON-RPC lines over its stdio,
//!   correlate concurrent requests to responses by id, enforce per-request
//!   timeouts, shut down cleanly.
//! - [`client`]: the `initialize` handshake and the typed MCP operations
//!   (list/call tools, list/read resources) layered over one transport.
//! - [`pool`]: supervise many named servers in parallel, health-probe them
//!   on a schedule, and route a tool call to the best server advertising it
//!   via a pluggable [`strategy`].
//!
//! HTTP/dashboard surfaces, configuration-file parsing, and in-process demo
//! servers are out of scope here — this crate exposes the typed operations
//! those layers consume.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mcp_runtime::{ManagerConfig, ClientInfo, PoolManager, SelectionStrategy, ServerConfig};
//!
//! let manager = Arc::new(PoolManager::new(
//!     ManagerConfig::default(),
//!     ClientInfo { name: "my-app".into(), version: "0.1.0".into() },
//!     SelectionStrategy::round_robin(),
//! ));
//! manager.add_server_config(ServerConfig::new("fs", "npx").with_args(["mcp-server-filesystem"])).await?;
//! manager.start().await;
//!
//! if let Some(client) = manager.get_client_for_tool("read_file").await {
//!     let result = client.call_tool("read_file", Some(serde_json::json!({"path": "/tmp/x"}))).await?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod state;
pub mod strategy;
pub mod transport;

pub use client::{Client, DEFAULT_PROTOCOL_VERSION};
pub use config::{ManagerConfig, ServerConfig};
pub use error::{ClientError, InitFailure, ManagerError, RemoteError, TransportError};
pub use pool::{PoolManager, ServerStatus};
pub use protocol::{ClientInfo, ResourceDef, ServerInfo, ToolCallResult, ToolDef};
pub use state::ConnectionState;
pub use strategy::{RoundRobinCursor, SelectionStrategy, ServerSnapshot};
pub use transport::ProcessTransport;
