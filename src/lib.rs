//! Dynamics 365 CRM MCP Library
//!
//! Model Context Protocol server answering read-only questions about open
//! opportunities, users and business units in Dynamics 365 CRM.

pub mod auth;
pub mod cache;
pub mod config;
pub mod crm;
pub mod error;
pub mod mcp;
pub mod odata;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AzureAdExchange, TokenProvider};
pub use cache::{EntityCache, EntityType, JsonFileBackend};
pub use config::{Config, RuntimeConfig};
pub use crm::{CrmClient, MatchPolicy};
pub use error::CrmError;
pub use odata::{ODataClient, QueryOptions};
