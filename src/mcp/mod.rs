//! MCP Server implementation for Dynamics 365 CRM
//!
//! Exposes read-only opportunity, user and division queries as tools

pub mod protocol;
mod server;

pub use protocol::*;
pub use server::CrmMcpServer;
