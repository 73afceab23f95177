//! Authenticated client context.
//!
//! Modules never see credentials. Upstream middleware decodes whatever the
//! platform forwards, builds a [`ClientContext`] and stores it in the request
//! extensions. Handlers only get a [`DataApi`] handle that already carries
//! the credentials it needs.

use std::sync::Arc;

use axum::http::Method;
use serde::Deserialize;

use crate::ServiceError;

/// One page of a record query.
///
/// Mirrors the org REST API: `done == false` means more pages exist and
/// `next_records_url` must be passed to [`DataApi::query_more`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    #[serde(default)]
    pub total_size: u64,
    pub done: bool,
    #[serde(default)]
    pub next_records_url: Option<String>,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
}

/// An outbound HTTP call made on behalf of the org.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    /// A JSON `POST` with the given body.
    pub fn post_json(body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(body),
        }
    }
}

/// Response of an [`OutboundRequest`].
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: String,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authenticated access to the org: record queries and outbound calls.
///
/// Implementations attach credentials themselves; callers pass plain
/// query text and URLs.
#[async_trait::async_trait]
pub trait DataApi: Send + Sync + 'static {
    /// Run a query and return its first page.
    async fn query(&self, soql: &str) -> Result<QueryPage, ServiceError>;

    /// Fetch the page behind a `nextRecordsUrl`.
    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage, ServiceError>;

    /// Issue an outbound HTTP call.
    async fn request(
        &self,
        url: &str,
        request: OutboundRequest,
    ) -> Result<OutboundResponse, ServiceError>;
}

/// Per-request context injected by the client-context middleware.
#[derive(Clone)]
pub struct ClientContext {
    pub org_id: String,
    pub user_id: String,
    pub request_id: String,
    /// `None` when the caller was identified but no query capability could
    /// be built (for example, no access token was forwarded).
    pub data_api: Option<Arc<dyn DataApi>>,
}

impl ClientContext {
    /// The query capability, or an authentication error when absent.
    pub fn require_data_api(&self) -> Result<Arc<dyn DataApi>, ServiceError> {
        self.data_api.clone().ok_or_else(|| {
            ServiceError::Unauthorized(format!(
                "client context for org {} has no data API access",
                self.org_id
            ))
        })
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("org_id", &self.org_id)
            .field("user_id", &self.user_id)
            .field("request_id", &self.request_id)
            .field("data_api", &self.data_api.is_some())
            .finish()
    }
}
