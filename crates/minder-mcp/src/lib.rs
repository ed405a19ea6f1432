//! MCP client pool: supervises one tool-provider subprocess per skill and
//! speaks JSON-RPC 2.0 over newline-delimited stdio.
//!
//! Clients start lazily on first use, cache their `tools/list` catalog, and
//! are destroyed by the idle sweeper, an explicit stop, or process death.

mod client;
mod pool;
mod protocol;

pub use client::{McpClient, McpError, ToolOutput};
pub use pool::{McpLaunchSpec, McpPool, PoolConfig};
pub use protocol::{McpToolDef, ToolCallResult};
