//! Client-context middleware.
//!
//! AppLink forwards the invoking user's org session in the
//! `x-client-context` header as base64-encoded JSON. The middleware decodes
//! it, builds an [`OrgClient`] and stores a [`ClientContext`] in the request
//! extensions for handlers to use.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use applink_core::ClientContext;

use crate::org_client::OrgClient;

pub const CLIENT_CONTEXT_HEADER: &str = "x-client-context";

/// Decoded `x-client-context` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedContext {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub namespace: String,
    pub org_id: String,
    pub org_domain_url: String,
    pub user_context: UserContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

/// Shared state for the middleware.
#[derive(Clone)]
pub struct ContextState {
    pub http: reqwest::Client,
    /// Used when the forwarded context names no API version.
    pub default_api_version: String,
}

#[derive(Debug)]
pub enum ContextError {
    Malformed(String),
}

impl IntoResponse for ContextError {
    fn into_response(self) -> Response {
        let ContextError::Malformed(e) = self;
        let body = serde_json::json!({ "error": format!("invalid client context: {}", e) });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

/// Decode the base64 JSON header value.
pub fn decode_header(value: &str) -> Result<ForwardedContext, ContextError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| ContextError::Malformed(format!("base64: {}", e)))?;
    serde_json::from_slice(&raw).map_err(|e| ContextError::Malformed(format!("json: {}", e)))
}

impl ContextState {
    /// Turn a forwarded context into the handler-facing one. A context
    /// without an access token identifies the caller but grants no data
    /// access.
    pub fn build(&self, fwd: ForwardedContext) -> Result<ClientContext, ContextError> {
        let data_api = if fwd.access_token.is_empty() {
            None
        } else {
            let version = if fwd.api_version.is_empty() {
                self.default_api_version.as_str()
            } else {
                fwd.api_version.as_str()
            };
            let client = OrgClient::new(
                self.http.clone(),
                &fwd.org_domain_url,
                version,
                fwd.access_token,
            )
            .map_err(|e| ContextError::Malformed(e.to_string()))?;
            Some(Arc::new(client) as Arc<dyn applink_core::DataApi>)
        };
        Ok(ClientContext {
            org_id: fwd.org_id,
            user_id: fwd.user_context.user_id,
            request_id: fwd.request_id,
            data_api,
        })
    }
}

/// Public paths pass through. A missing header leaves the request without a
/// context so the handler can answer 401; a header that cannot be decoded is
/// rejected here.
pub async fn client_context_middleware(
    State(state): State<Arc<ContextState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ContextError> {
    if is_public_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let Some(value) = request.headers().get(CLIENT_CONTEXT_HEADER) else {
        return Ok(next.run(request).await);
    };
    let value = value
        .to_str()
        .map_err(|_| ContextError::Malformed("header is not ASCII".into()))?;

    let fwd = decode_header(value)?;
    debug!(
        org_id = %fwd.org_id,
        username = %fwd.user_context.username,
        namespace = %fwd.namespace,
        request_id = %fwd.request_id,
        "client context attached"
    );
    let ctx = state.build(fwd)?;
    request.extensions_mut().insert(ctx);

    Ok(next.run(request).await)
}

fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/version")
}
