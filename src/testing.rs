//! In-process fakes for the remote seams

use crate::auth::{AuthError, AuthToken, CredentialExchange};
use crate::error::CrmError;
use crate::odata::{ODataResponse, ODataTransport, QueryOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One request seen by [`FakeTransport`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub entity_set: String,
    pub options: QueryOptions,
    pub next_link: Option<String>,
}

impl RecordedCall {
    pub fn filter(&self) -> &str {
        self.options.filter.as_deref().unwrap_or("")
    }
}

/// Replays queued pages per entity set; an empty queue yields an empty page
#[derive(Default)]
pub struct FakeTransport {
    queued: Mutex<HashMap<String, VecDeque<Result<ODataResponse, CrmError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, entity_set: &str, rows: Vec<Value>, next_link: Option<&str>) {
        self.push(
            entity_set,
            Ok(ODataResponse {
                next_link: next_link.map(String::from),
                value: rows,
            }),
        );
    }

    pub fn push_error(&self, entity_set: &str, error: CrmError) {
        self.push(entity_set, Err(error));
    }

    fn push(&self, entity_set: &str, item: Result<ODataResponse, CrmError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(entity_set.to_string())
            .or_default()
            .push_back(item);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, entity_set: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.entity_set == entity_set)
            .collect()
    }
}

#[async_trait]
impl ODataTransport for FakeTransport {
    async fn fetch_page(
        &self,
        entity_set: &str,
        options: &QueryOptions,
        next_link: Option<&str>,
    ) -> Result<ODataResponse, CrmError> {
        self.calls.lock().unwrap().push(RecordedCall {
            entity_set: entity_set.to_string(),
            options: options.clone(),
            next_link: next_link.map(String::from),
        });

        self.queued
            .lock()
            .unwrap()
            .get_mut(entity_set)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(ODataResponse::default()))
    }
}

/// Hands out `token-1`, `token-2`, ... after a short delay
pub struct FakeExchange {
    calls: AtomicUsize,
    lifetime: Duration,
    fail: bool,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::with_lifetime(Duration::from_secs(3600))
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            lifetime,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchange for FakeExchange {
    async fn exchange(&self) -> Result<AuthToken, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail {
            return Err(AuthError::TokenRequestFailed("Status: 401 Unauthorized".into()));
        }
        Ok(AuthToken {
            value: format!("token-{}", n),
            expires_at: Instant::now() + self.lifetime,
        })
    }
}
