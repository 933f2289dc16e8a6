//! MCP Server implementation for Dynamics 365 CRM
//!
//! Exposes the read-only CRM queries as tools. Arguments are validated here;
//! all lookup and caching behaviour lives in [`CrmClient`].

use crate::crm::{CrmClient, DEFAULT_TOP};
use crate::error::CrmError;
use crate::mcp::protocol::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const GET_OPEN_OPPORTUNITIES: &str = "get_open_opportunities";
pub const GET_USERS: &str = "get_users";
pub const GET_DIVISIONS: &str = "get_divisions";

/// MCP Server for Dynamics 365 CRM
pub struct CrmMcpServer {
    client: Arc<CrmClient>,
}

impl CrmMcpServer {
    /// Create a new MCP server instance
    pub fn new(client: Arc<CrmClient>) -> Self {
        Self { client }
    }

    /// Get list of available tools
    pub fn get_tools(&self) -> Vec<Tool> {
        let mut opportunities_schema = create_tool_schema(vec![
            ("top", "integer", "Maximum number of records to return", false),
            (
                "owner",
                "string",
                "Filter by owner name (e.g., 'John Smith'). Will be resolved to ID automatically",
                false,
            ),
            (
                "division",
                "string",
                "Filter by division name (e.g., 'Sales'). Will be resolved to ID automatically",
                false,
            ),
        ]);
        opportunities_schema["properties"]["top"]["default"] = json!(DEFAULT_TOP);
        opportunities_schema["properties"]["top"]["minimum"] = json!(1);

        vec![
            Tool {
                name: GET_OPEN_OPPORTUNITIES.to_string(),
                description: "Get open opportunities with optional filtering by Owner and/or Division. Returns opportunities with human-readable names for owners, customers, and divisions.".to_string(),
                input_schema: opportunities_schema,
            },
            Tool {
                name: GET_USERS.to_string(),
                description: "Get all active users who can own opportunities. Returns list of users with their full names, domain names, and system user IDs.".to_string(),
                input_schema: create_tool_schema(vec![]),
            },
            Tool {
                name: GET_DIVISIONS.to_string(),
                description: "Get all active business units (divisions) from Dynamics 365. Returns list of divisions with names, division names, and business unit IDs.".to_string(),
                input_schema: create_tool_schema(vec![]),
            },
        ]
    }

    /// Handle a tool call
    pub async fn call_tool(&self, name: &str, args: &HashMap<String, Value>) -> CallToolResult {
        tracing::info!("Calling tool: {}", name);

        let result = match name {
            GET_OPEN_OPPORTUNITIES => self.get_open_opportunities(args).await,
            GET_USERS => self
                .client
                .get_users()
                .await
                .map(|users| envelope("users", &users)),
            GET_DIVISIONS => self
                .client
                .get_divisions()
                .await
                .map(|divisions| envelope("divisions", &divisions)),
            _ => {
                tracing::warn!("Unknown tool name: {}", name);
                return CallToolResult::error(
                    "invalid_argument",
                    format!("Unsupported tool operation '{}'", name),
                );
            }
        };

        match result {
            Ok(payload) => CallToolResult::json(&payload),
            Err(e) => {
                tracing::warn!("Tool {} failed: {}", name, e);
                CallToolResult::error(e.kind(), e.to_string())
            }
        }
    }

    async fn get_open_opportunities(&self, args: &HashMap<String, Value>) -> Result<Value, CrmError> {
        let top = parse_top(args)?;
        let owner = parse_name_arg(args, "owner")?;
        let division = parse_name_arg(args, "division")?;

        let opportunities = self
            .client
            .get_open_opportunities(owner.as_deref(), division.as_deref(), top)
            .await?;
        Ok(envelope("opportunities", &opportunities))
    }

    /// Dispatch one JSON-RPC message; notifications get no response
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!("Notification: {}", request.method);
            return None;
        }
        let id = request.id.clone();

        let response = match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: Some(false),
                        }),
                    },
                    server_info: ServerInfo {
                        name: "crm-mcp".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                to_response(id, &result)
            }

            "tools/list" => to_response(
                id,
                &ListToolsResult {
                    tools: self.get_tools(),
                },
            ),

            "tools/call" => {
                let params: CallToolParams = match request.params.map(serde_json::from_value) {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        return Some(JsonRpcResponse::error(
                            id,
                            INVALID_PARAMS,
                            &format!("Invalid params: {}", e),
                        ))
                    }
                    None => return Some(JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params")),
                };

                let args = params.arguments.unwrap_or_default();
                let result = self.call_tool(&params.name, &args).await;
                to_response(id, &result)
            }

            "ping" => JsonRpcResponse::success(id, json!({})),

            _ => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            ),
        };

        Some(response)
    }
}

fn to_response<T: Serialize>(id: Option<Value>, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, -32603, &format!("Internal error: {}", e)),
    }
}

/// `{"count": n, "<key>": [...]}`
fn envelope<T: Serialize>(key: &str, items: &[T]) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("count".to_string(), json!(items.len()));
    payload.insert(key.to_string(), json!(items));
    Value::Object(payload)
}

/// Parse `top` (number or numeric string); absent means the default
fn parse_top(args: &HashMap<String, Value>) -> Result<usize, CrmError> {
    let invalid = |v: &Value| {
        CrmError::InvalidArgument(format!("top must be a positive integer, got {}", v))
    };

    match args.get("top") {
        None | Some(Value::Null) => Ok(DEFAULT_TOP),
        Some(v @ Value::Number(n)) => match n.as_u64() {
            Some(top) if top > 0 => usize::try_from(top).map_err(|_| invalid(v)),
            _ => Err(invalid(v)),
        },
        Some(v @ Value::String(s)) => match s.trim().parse::<usize>() {
            Ok(top) if top > 0 => Ok(top),
            _ => Err(invalid(v)),
        },
        Some(v) => Err(invalid(v)),
    }
}

/// Optional name filter; blank strings count as absent
fn parse_name_arg(args: &HashMap<String, Value>, key: &str) -> Result<Option<String>, CrmError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(CrmError::InvalidArgument(format!(
            "{} must be a string, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityCache, MemoryBackend};
    use crate::testing::FakeTransport;
    use tokio_test::assert_err;

    fn server() -> (CrmMcpServer, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let cache = Arc::new(EntityCache::load(
            Arc::new(MemoryBackend::new()),
            chrono::Duration::days(7),
        ));
        let client = Arc::new(CrmClient::new(transport.clone(), cache));
        (CrmMcpServer::new(client), transport)
    }

    fn args(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn payload(result: &CallToolResult) -> Value {
        serde_json::from_str(&result.content[0].text).unwrap()
    }

    #[test]
    fn test_parse_top() {
        assert_eq!(parse_top(&args(json!({}))).unwrap(), DEFAULT_TOP);
        assert_eq!(parse_top(&args(json!({"top": 5}))).unwrap(), 5);
        assert_eq!(parse_top(&args(json!({"top": "25"}))).unwrap(), 25);
        assert_err!(parse_top(&args(json!({"top": 0}))));
        assert_err!(parse_top(&args(json!({"top": -3}))));
        assert_err!(parse_top(&args(json!({"top": 2.5}))));
        assert_err!(parse_top(&args(json!({"top": "many"}))));
        assert_err!(parse_top(&args(json!({"top": true}))));
    }

    #[test]
    fn test_parse_name_arg() {
        assert_eq!(parse_name_arg(&args(json!({"owner": " "})), "owner").unwrap(), None);
        assert_eq!(
            parse_name_arg(&args(json!({"owner": " Jane Doe "})), "owner").unwrap(),
            Some("Jane Doe".to_string())
        );
        assert_err!(parse_name_arg(&args(json!({"owner": 7})), "owner"));
    }

    #[test]
    fn test_tool_list() {
        let (server, _) = server();
        let tools = server.get_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

        assert_eq!(names, vec![GET_OPEN_OPPORTUNITIES, GET_USERS, GET_DIVISIONS]);
        assert_eq!(tools[0].input_schema["properties"]["top"]["default"], 1000);
        assert_eq!(tools[0].input_schema["properties"]["top"]["type"], "integer");
    }

    #[tokio::test]
    async fn test_invalid_top_never_reaches_crm() {
        let (server, transport) = server();
        let result = server
            .call_tool(GET_OPEN_OPPORTUNITIES, &args(json!({"top": 0})))
            .await;

        assert_eq!(result.is_error, Some(true));
        assert_eq!(payload(&result)["error"]["kind"], "invalid_argument");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_opportunities_envelope() {
        let (server, transport) = server();
        transport.push_page(
            "opportunities",
            vec![json!({"name": "Deal", "_ownerid_value": null})],
            None,
        );

        let result = server
            .call_tool(GET_OPEN_OPPORTUNITIES, &args(json!({"top": "3"})))
            .await;

        assert_eq!(result.is_error, None);
        let body = payload(&result);
        assert_eq!(body["count"], 1);
        assert_eq!(body["opportunities"][0]["name"], "Deal");
        assert_eq!(transport.calls_to("opportunities")[0].options.top, Some(3));
    }

    #[tokio::test]
    async fn test_crm_errors_become_structured_results() {
        let (server, transport) = server();
        transport.push_error(
            "systemusers",
            CrmError::Remote {
                status: 500,
                body: "Generic SQL error".into(),
            },
        );

        let result = server.call_tool(GET_USERS, &HashMap::new()).await;

        assert_eq!(result.is_error, Some(true));
        let body = payload(&result);
        assert_eq!(body["error"]["kind"], "remote_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (server, _) = server();
        let result = server.call_tool("delete_everything", &HashMap::new()).await;
        assert_eq!(payload(&result)["error"]["kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_handle_request_methods() {
        let (server, _) = server();

        let init: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        }))
        .unwrap();
        let response = server.handle_request(init).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "crm-mcp");

        let notification: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(server.handle_request(notification).await.is_none());

        let unknown: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "method": "resources/list"
        }))
        .unwrap();
        let response = server.handle_request(unknown).await.unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let missing: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call"
        }))
        .unwrap();
        let response = server.handle_request(missing).await.unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tools_call_round_trip() {
        let (server, transport) = server();
        transport.push_page(
            "businessunits",
            vec![json!({"businessunitid": "22222222-0000-0000-0000-000000000001", "name": "Sales"})],
            None,
        );

        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": "abc", "method": "tools/call",
            "params": {"name": "get_divisions"}
        }))
        .unwrap();
        let response = server.handle_request(request).await.unwrap();

        assert_eq!(response.id, Some(json!("abc")));
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        let body = payload(&result);
        assert_eq!(body["count"], 1);
        assert_eq!(body["divisions"][0]["name"], "Sales");
    }
}
