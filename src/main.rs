//! Dynamics 365 CRM MCP Server
//!
//! Entry point for the MCP server binary.
//! Implements MCP protocol over stdio using JSON-RPC 2.0.

use anyhow::Context;
use crm_mcp::auth::{AzureAdExchange, TokenProvider};
use crm_mcp::cache::{EntityCache, JsonFileBackend};
use crm_mcp::config::RuntimeConfig;
use crm_mcp::crm::CrmClient;
use crm_mcp::mcp::{CrmMcpServer, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crm_mcp::odata::ODataClient;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging to stderr (MCP uses stdout for protocol)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Dynamics 365 CRM MCP Server...");

    let config = RuntimeConfig::load_default().context("failed to load configuration")?;

    tracing::info!(
        "Configured for {} (match policy: {}, cache: {})",
        config.api_url(),
        config.match_policy,
        config.cache_file.display()
    );

    // Initialize authentication
    let exchange = AzureAdExchange::new(
        &config.authority_host,
        config.tenant_id.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
        &config.resource,
        config.timeout,
    )?;
    let auth = Arc::new(TokenProvider::new(Arc::new(exchange)));

    // Initialize OData client
    let transport = Arc::new(ODataClient::new(auth, config.api_url(), config.timeout)?);

    let cache = Arc::new(EntityCache::load(
        Arc::new(JsonFileBackend::new(config.cache_file.clone())),
        config.cache_ttl,
    ));

    let client = CrmClient::new(transport, cache.clone())
        .with_match_policy(config.match_policy)
        .with_division_field(config.division_field.clone())
        .with_max_page_count(config.max_page_count);

    // Create MCP server
    let server = CrmMcpServer::new(Arc::new(client));

    tracing::info!("MCP Server ready, listening on stdio...");

    let result = run_stdio_loop(&server).await;

    if let Err(e) = cache.flush().await {
        tracing::warn!("Failed to flush entity cache on shutdown: {}", e);
    }

    result
}

async fn run_stdio_loop(server: &CrmMcpServer) -> anyhow::Result<()> {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next().await {
        let line = line.context("failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        tracing::debug!("Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let error_response =
                    JsonRpcResponse::error(None, PARSE_ERROR, &format!("Parse error: {}", e));
                send_response(&mut stdout, &error_response).await?;
                continue;
            }
        };

        if let Some(response) = server.handle_request(request).await {
            send_response(&mut stdout, &response).await?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn send_response(stdout: &mut Stdout, response: &JsonRpcResponse) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(response)?;
    tracing::debug!("Sending: {}", json);
    json.push('\n');
    stdout.write_all(json.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
