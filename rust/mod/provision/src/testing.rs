//! In-memory org for tests: scripted query pages, recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use applink_core::{DataApi, OutboundRequest, OutboundResponse, QueryPage, ServiceError};
use async_trait::async_trait;
use serde_json::{json, Value};

const SETTINGS_PREFIX: &str = "SELECT DeveloperName";

#[derive(Default)]
struct State {
    pages: VecDeque<Value>,
    more: HashMap<String, Value>,
    settings: Option<Value>,
    queries: Vec<String>,
    more_calls: Vec<String>,
    requests: Vec<(String, OutboundRequest)>,
}

pub struct FakeOrg {
    state: Mutex<State>,
    fail_queries: bool,
    fail_settings: bool,
    fail_requests: bool,
    request_status: u16,
}

impl FakeOrg {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_queries: false,
            fail_settings: false,
            fail_requests: false,
            request_status: 200,
        }
    }

    /// Next page returned by `query` for record queries.
    pub fn with_page(self, page: Value) -> Self {
        self.state.lock().unwrap().pages.push_back(page);
        self
    }

    /// Page returned by `query_more(url)`.
    pub fn with_more(self, url: &str, page: Value) -> Self {
        self.state.lock().unwrap().more.insert(url.to_string(), page);
        self
    }

    /// Rows returned for the settings query.
    pub fn with_settings(self, rows: Value) -> Self {
        self.state.lock().unwrap().settings = Some(rows);
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    pub fn failing_settings(mut self) -> Self {
        self.fail_settings = true;
        self
    }

    pub fn failing_requests(mut self) -> Self {
        self.fail_requests = true;
        self
    }

    pub fn with_request_status(mut self, status: u16) -> Self {
        self.request_status = status;
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn more_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().more_calls.clone()
    }

    pub fn requests(&self) -> Vec<(String, OutboundRequest)> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn page(value: Value) -> Result<QueryPage, ServiceError> {
    serde_json::from_value(value).map_err(|e| ServiceError::Internal(format!("bad fake page: {e}")))
}

#[async_trait]
impl DataApi for FakeOrg {
    async fn query(&self, soql: &str) -> Result<QueryPage, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(soql.to_string());
        if self.fail_queries {
            return Err(ServiceError::Upstream("query failed: INVALID_SESSION_ID".into()));
        }
        if soql.starts_with(SETTINGS_PREFIX) {
            if self.fail_settings {
                return Err(ServiceError::Upstream("sObject type not supported".into()));
            }
            let rows = state.settings.clone().unwrap_or_else(|| json!([]));
            return page(json!({"done": true, "records": rows}));
        }
        let next = state
            .pages
            .pop_front()
            .unwrap_or_else(|| json!({"done": true, "records": []}));
        page(next)
    }

    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.more_calls.push(next_records_url.to_string());
        match state.more.get(next_records_url) {
            Some(value) => page(value.clone()),
            None => Err(ServiceError::Upstream(format!("no page at {next_records_url}"))),
        }
    }

    async fn request(
        &self,
        url: &str,
        request: OutboundRequest,
    ) -> Result<OutboundResponse, ServiceError> {
        self.state
            .lock()
            .unwrap()
            .requests
            .push((url.to_string(), request));
        if self.fail_requests {
            return Err(ServiceError::Upstream("connection refused".into()));
        }
        Ok(OutboundResponse {
            status: self.request_status,
            body: String::new(),
        })
    }
}

pub fn opportunity_json(id: &str, items: &[Value]) -> Value {
    json!({
        "attributes": {"type": "Opportunity"},
        "Id": id,
        "Name": format!("Opportunity {id}"),
        "OpportunityLineItems": {
            "totalSize": items.len(),
            "done": true,
            "records": items,
        },
    })
}

pub fn line_item_json(id: &str, product: &str, quantity: f64) -> Value {
    json!({
        "attributes": {"type": "OpportunityLineItem"},
        "Id": id,
        "Product2": {"Name": product},
        "Quantity": quantity,
        "UnitPrice": 100.0,
        "PricebookEntryId": "01u000000000001AAA",
    })
}
