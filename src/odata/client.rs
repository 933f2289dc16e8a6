//! OData Client module
//!
//! HTTP client for the Dynamics 365 Web API (Dataverse)

use crate::auth::{AuthError, AuthToken, TokenProvider};
use crate::error::CrmError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Query options for OData requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub filter: Option<String>,
    pub top: Option<usize>,
    pub orderby: Option<String>,
}

impl QueryOptions {
    /// Build query string from options, percent-encoding each value
    pub fn to_query_string(&self) -> String {
        let mut params = Vec::new();

        if let Some(ref select) = self.select {
            params.push(format!("$select={}", urlencoding::encode(&select.join(","))));
        }

        if let Some(ref filter) = self.filter {
            params.push(format!("$filter={}", urlencoding::encode(filter)));
        }

        if let Some(top) = self.top {
            params.push(format!("$top={}", top));
        }

        if let Some(ref orderby) = self.orderby {
            params.push(format!("$orderby={}", urlencoding::encode(orderby)));
        }

        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

/// OData response with paging support
#[derive(Debug, Default, Deserialize)]
pub struct ODataResponse {
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,

    #[serde(default)]
    pub value: Vec<Value>,
}

/// Fetches one page of an entity set
#[async_trait]
pub trait ODataTransport: Send + Sync {
    /// `next_link`, when given, replaces the URL built from `entity_set` and `options`
    async fn fetch_page(
        &self,
        entity_set: &str,
        options: &QueryOptions,
        next_link: Option<&str>,
    ) -> Result<ODataResponse, CrmError>;
}

/// Fetch all pages for an entity, following `@odata.nextLink` up to `max_pages`
pub async fn fetch_all_pages(
    transport: &dyn ODataTransport,
    entity_set: &str,
    options: &QueryOptions,
    max_pages: usize,
) -> Result<Vec<Value>, CrmError> {
    let mut all_records = Vec::new();
    let mut next_link: Option<String> = None;
    let mut page = 0;

    loop {
        page += 1;
        let response = transport
            .fetch_page(entity_set, options, next_link.as_deref())
            .await?;

        tracing::debug!("{} page {}: fetched {} records", entity_set, page, response.value.len());
        all_records.extend(response.value);

        match response.next_link {
            Some(link) if page < max_pages => next_link = Some(link),
            Some(_) => {
                tracing::warn!(
                    "Stopped paging {} after {} pages ({} records)",
                    entity_set,
                    page,
                    all_records.len()
                );
                break;
            }
            None => break,
        }
    }

    Ok(all_records)
}

/// OData client for the Dataverse Web API
pub struct ODataClient {
    auth: Arc<TokenProvider>,
    endpoint: String,
    http_client: Client,
}

impl ODataClient {
    /// Create a new OData client
    ///
    /// # Arguments
    /// * `auth` - Token provider for the CRM resource
    /// * `endpoint` - Service root URL (e.g., "https://org.crm.dynamics.com/api/data/v9.1/")
    /// * `timeout` - Upper bound for every request
    pub fn new(auth: Arc<TokenProvider>, endpoint: String, timeout: Duration) -> Result<Self, CrmError> {
        // Ensure endpoint ends with /
        let endpoint = if endpoint.ends_with('/') {
            endpoint
        } else {
            format!("{}/", endpoint)
        };

        let http_client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CrmError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            auth,
            endpoint,
            http_client,
        })
    }

    /// Get endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url_for(&self, entity_set: &str, options: &QueryOptions) -> String {
        format!("{}{}{}", self.endpoint, entity_set, options.to_query_string())
    }

    async fn send(&self, url: &str, token: &AuthToken) -> Result<Response, CrmError> {
        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("Bearer {}", token.value))
            .header("Accept", "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Prefer", "odata.include-annotations=*")
            .send()
            .await?;
        Ok(response)
    }

    /// Send with a bearer token; a 401 invalidates the token and retries once
    async fn execute(&self, url: &str) -> Result<Response, CrmError> {
        let token = self.auth.get_token().await?;
        let response = self.send(url, &token).await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("CRM rejected the bearer token, re-authenticating once");
            self.auth.invalidate(&token).await;
            let token = self.auth.get_token().await?;
            self.send(url, &token).await?
        } else {
            response
        };

        check_status(response).await
    }
}

#[async_trait]
impl ODataTransport for ODataClient {
    async fn fetch_page(
        &self,
        entity_set: &str,
        options: &QueryOptions,
        next_link: Option<&str>,
    ) -> Result<ODataResponse, CrmError> {
        let url = match next_link {
            Some(link) => link.to_string(),
            None => self.url_for(entity_set, options),
        };

        tracing::debug!("Fetching: {}", url);

        let response = self.execute(&url).await?;
        // A stalled or dropped body is a transport failure, not a parse error
        let body = response.bytes().await?;
        let odata_response: ODataResponse = serde_json::from_slice(&body).map_err(|e| {
            CrmError::Parse(format!("Failed to parse OData response: {}", e))
        })?;

        Ok(odata_response)
    }
}

/// Map a non-success status to the error taxonomy
async fn check_status(response: Response) -> Result<Response, CrmError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let status = response.status().as_u16();
            Err(CrmError::Auth(AuthError::Rejected(status)))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Err(CrmError::RateLimited(retry_after))
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(CrmError::Remote {
                status: status.as_u16(),
                body: remote_message(&body),
            })
        }
    }
}

/// Pull `error.message` out of a Dataverse error body, falling back to the raw text
fn remote_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    #[test]
    fn test_query_options_empty() {
        let options = QueryOptions::default();
        assert_eq!(options.to_query_string(), "");
    }

    #[test]
    fn test_query_options_full() {
        let options = QueryOptions {
            select: Some(vec!["name".to_string(), "createdon".to_string()]),
            filter: Some("statecode eq 0".to_string()),
            top: Some(10),
            orderby: Some("createdon desc".to_string()),
        };

        let query = options.to_query_string();
        assert!(query.contains("$select=name%2Ccreatedon"));
        assert!(query.contains("$filter=statecode%20eq%200"));
        assert!(query.contains("$top=10"));
        assert!(query.contains("$orderby=createdon%20desc"));
    }

    #[test]
    fn test_filter_value_cannot_break_out_of_query() {
        let options = QueryOptions {
            filter: Some("name eq 'A&B #1'".to_string()),
            ..Default::default()
        };
        let query = options.to_query_string();
        assert!(!query.contains('&'));
        assert!(!query.contains('#'));
    }

    #[test]
    fn test_remote_message_extraction() {
        let body = r#"{"error":{"code":"0x80060888","message":"Resource not found for the segment 'opportunity'."}}"#;
        assert_eq!(remote_message(body), "Resource not found for the segment 'opportunity'.");
        assert_eq!(remote_message("plain failure"), "plain failure");
    }

    /// Serves canned HTTP responses in order, recording each request head
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<std::sync::Mutex<Vec<String>>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let mut head = String::new();
                while !head.contains("\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.push_str(&String::from_utf8_lossy(&buf[..n]));
                }
                log.lock().unwrap().push(head);
                if response.is_empty() {
                    // Hold the connection open without answering
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{}/api/data/v9.1/", addr), seen)
    }

    fn provider() -> (Arc<TokenProvider>, Arc<crate::testing::FakeExchange>) {
        let exchange = Arc::new(crate::testing::FakeExchange::new());
        (Arc::new(TokenProvider::new(exchange.clone())), exchange)
    }

    const UNAUTHORIZED: &str =
        "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const OK_EMPTY: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 12\r\nconnection: close\r\n\r\n{\"value\":[]}";

    #[tokio::test]
    async fn test_unauthorized_triggers_one_reauth_and_retry() {
        let (endpoint, seen) = serve(vec![UNAUTHORIZED, OK_EMPTY]).await;
        let (auth, exchange) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_secs(5)).unwrap();

        let response = client
            .fetch_page("systemusers", &QueryOptions::default(), None)
            .await
            .unwrap();

        assert!(response.value.is_empty());
        assert_eq!(exchange.calls(), 2);
        let heads = seen.lock().unwrap();
        assert_eq!(heads.len(), 2);
        assert!(heads[0].to_lowercase().contains("authorization: bearer token-1"));
        assert!(heads[1].to_lowercase().contains("authorization: bearer token-2"));
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_surfaced() {
        let (endpoint, seen) = serve(vec![UNAUTHORIZED, UNAUTHORIZED, OK_EMPTY]).await;
        let (auth, exchange) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_secs(5)).unwrap();

        let err = client
            .fetch_page("systemusers", &QueryOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::Auth(AuthError::Rejected(401))));
        assert_eq!(exchange.calls(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried() {
        let (endpoint, seen) = serve(vec![
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 7\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            OK_EMPTY,
        ])
        .await;
        let (auth, _) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_secs(5)).unwrap();

        let err = client
            .fetch_page("opportunities", &QueryOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::RateLimited(7)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_server_times_out_as_network_error() {
        let (endpoint, _) = serve(vec![""]).await;
        let (auth, _) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_millis(200)).unwrap();

        let err = client
            .fetch_page("opportunities", &QueryOptions::default(), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "network_error");
    }

    #[tokio::test]
    async fn test_body_stall_times_out_as_network_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/api/data/v9.1/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"value\":[")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (auth, _) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_millis(300)).unwrap();

        let err = client
            .fetch_page("opportunities", &QueryOptions::default(), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "network_error");
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let (endpoint, _) = serve(vec![
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot json!",
        ])
        .await;
        let (auth, _) = provider();
        let client = ODataClient::new(auth, endpoint, Duration::from_secs(5)).unwrap();

        let err = client
            .fetch_page("opportunities", &QueryOptions::default(), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "parse_error");
    }

    #[tokio::test]
    async fn test_fetch_all_pages_follows_next_link() {
        let transport = FakeTransport::new();
        transport.push_page(
            "systemusers",
            vec![serde_json::json!({"fullname": "A"})],
            Some("https://next/1"),
        );
        transport.push_page("systemusers", vec![serde_json::json!({"fullname": "B"})], None);

        let records = fetch_all_pages(&transport, "systemusers", &QueryOptions::default(), 10)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let calls = transport.calls();
        assert_eq!(calls[1].next_link.as_deref(), Some("https://next/1"));
    }

    #[tokio::test]
    async fn test_fetch_all_pages_stops_at_limit() {
        let transport = FakeTransport::new();
        for i in 0..5 {
            transport.push_page(
                "businessunits",
                vec![serde_json::json!({"name": i})],
                Some("https://next"),
            );
        }

        let records = fetch_all_pages(&transport, "businessunits", &QueryOptions::default(), 3)
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(transport.calls().len(), 3);
    }
}
