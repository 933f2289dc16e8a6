//! OData module
//!
//! HTTP client and filter utilities for the Dynamics 365 Web API

pub mod client;
pub mod filter;

pub use client::{fetch_all_pages, ODataClient, ODataResponse, ODataTransport, QueryOptions};
