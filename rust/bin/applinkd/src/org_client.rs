//! reqwest-backed [`DataApi`] for one org, built per request from the
//! forwarded client context.

use applink_core::{DataApi, OutboundRequest, OutboundResponse, QueryPage, ServiceError};
use async_trait::async_trait;
use url::Url;

pub struct OrgClient {
    http: reqwest::Client,
    domain: Url,
    api_version: String,
    access_token: String,
}

impl std::fmt::Debug for OrgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgClient")
            .field("domain", &self.domain.as_str())
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl OrgClient {
    pub fn new(
        http: reqwest::Client,
        org_domain_url: &str,
        api_version: &str,
        access_token: String,
    ) -> Result<Self, ServiceError> {
        let domain = Url::parse(org_domain_url)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid orgDomainUrl: {e}")))?;
        if !matches!(domain.scheme(), "http" | "https") || !domain.has_host() {
            return Err(ServiceError::Unauthorized(format!(
                "orgDomainUrl must be an http(s) URL: {org_domain_url}"
            )));
        }
        Ok(Self {
            http,
            domain,
            api_version: api_version.trim_start_matches('v').to_string(),
            access_token,
        })
    }

    /// Absolute URLs are used as given; anything else is joined onto the
    /// org domain.
    fn resolve(&self, url: &str) -> Result<Url, ServiceError> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .domain
                .join(url)
                .map_err(|e| ServiceError::Validation(format!("invalid url {url:?}: {e}"))),
            Err(e) => Err(ServiceError::Validation(format!("invalid url {url:?}: {e}"))),
        }
    }

    fn is_org_origin(&self, url: &Url) -> bool {
        url.origin() == self.domain.origin()
    }

    async fn get_page(&self, url: Url) -> Result<QueryPage, ServiceError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("query request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = api_error_message(&body).unwrap_or(body);
            return Err(match status.as_u16() {
                401 | 403 => ServiceError::Unauthorized(format!("org rejected credentials: {message}")),
                code => ServiceError::Upstream(format!("query failed ({code}): {message}")),
            });
        }
        resp.json::<QueryPage>()
            .await
            .map_err(|e| ServiceError::Upstream(format!("query response: {e}")))
    }
}

/// Org errors come back as `[{"message": "...", "errorCode": "..."}]`.
fn api_error_message(body: &str) -> Option<String> {
    let errors: Vec<serde_json::Value> = serde_json::from_str(body).ok()?;
    let first = errors.first()?;
    let message = first.get("message")?.as_str()?;
    match first.get("errorCode").and_then(|c| c.as_str()) {
        Some(code) => Some(format!("{code}: {message}")),
        None => Some(message.to_string()),
    }
}

#[async_trait]
impl DataApi for OrgClient {
    async fn query(&self, soql: &str) -> Result<QueryPage, ServiceError> {
        let mut url = self
            .domain
            .join(&format!("/services/data/v{}/query", self.api_version))
            .map_err(|e| ServiceError::Internal(format!("query url: {e}")))?;
        url.query_pairs_mut().append_pair("q", soql);
        self.get_page(url).await
    }

    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage, ServiceError> {
        let url = self.resolve(next_records_url)?;
        if !self.is_org_origin(&url) {
            return Err(ServiceError::Upstream(format!(
                "nextRecordsUrl points outside the org: {url}"
            )));
        }
        self.get_page(url).await
    }

    async fn request(
        &self,
        url: &str,
        request: OutboundRequest,
    ) -> Result<OutboundResponse, ServiceError> {
        let url = self.resolve(url)?;
        let with_credentials = self.is_org_origin(&url);

        let mut builder = self.http.request(request.method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if with_credentials {
            builder = builder.bearer_auth(&self.access_token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("outbound request failed: {e}")))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ServiceError::Upstream(format!("outbound response: {e}")))?;
        Ok(OutboundResponse { status, body })
    }
}
