//! Opportunity fetch: query construction, pagination and typed decoding.
//!
//! Raw query rows are decoded into private wire structs at this boundary;
//! the rest of the crate only sees [`ParentRecord`] and [`LineItem`].

use applink_core::{DataApi, QueryPage, ServiceError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{LineItem, ParentRecord, RejectedItem};
use crate::record_id;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// A nested child relationship as returned inside a parent row.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedPage<T> {
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
    #[serde(default = "Vec::new")]
    records: Vec<T>,
}

fn default_done() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OpportunityRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    opportunity_line_items: Option<NestedPage<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LineItemRow {
    id: String,
    #[serde(default)]
    product2: Option<ProductRow>,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    unit_price: Option<f64>,
    #[serde(default)]
    pricebook_entry_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProductRow {
    #[serde(default)]
    name: Option<String>,
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        LineItem {
            id: row.id,
            product_name: row.product2.and_then(|p| p.name),
            quantity: row.quantity.unwrap_or(0.0),
            unit_price: row.unit_price.unwrap_or(0.0),
            pricebook_entry_id: row.pricebook_entry_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Query text
// ---------------------------------------------------------------------------

/// Build the opportunity + line item query.
///
/// Every id must already have passed [`record_id::sanitize`]; ids that do not
/// are refused here as a second line of defence.
pub fn opportunities_query(ids: &[String]) -> Result<String, ServiceError> {
    if ids.is_empty() {
        return Err(ServiceError::Validation("no record ids to query".into()));
    }
    let mut quoted = Vec::with_capacity(ids.len());
    for id in ids {
        let id = record_id::sanitize(id)
            .ok_or_else(|| ServiceError::Validation(format!("malformed record id: {id:?}")))?;
        quoted.push(format!("'{id}'"));
    }
    Ok(format!(
        "SELECT Id, Name, \
         (SELECT Id, Product2.Name, Quantity, UnitPrice, PricebookEntryId FROM OpportunityLineItems) \
         FROM Opportunity WHERE Id IN ({})",
        quoted.join(", ")
    ))
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `soql` and follow `nextRecordsUrl` until the API reports `done`.
pub async fn query_all(api: &dyn DataApi, soql: &str) -> Result<Vec<Value>, ServiceError> {
    let first = api.query(soql).await?;
    drain_pages(api, first).await
}

async fn drain_pages(api: &dyn DataApi, mut page: QueryPage) -> Result<Vec<Value>, ServiceError> {
    let mut records = std::mem::take(&mut page.records);
    let mut pages = 1usize;
    while !page.done {
        let next = page.next_records_url.take().ok_or_else(|| {
            ServiceError::Upstream("query page not done but has no nextRecordsUrl".into())
        })?;
        page = api.query_more(&next).await?;
        records.append(&mut page.records);
        pages += 1;
    }
    debug!(pages, records = records.len(), "query drained");
    Ok(records)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ServiceError> {
    serde_json::from_value(value)
        .map_err(|e| ServiceError::Upstream(format!("unexpected record shape: {e}")))
}

/// Result of [`fetch_opportunities`].
#[derive(Debug, Default)]
pub struct Fetched {
    pub parents: Vec<ParentRecord>,
    /// Ids of opportunity rows that came back but could not be decoded.
    pub skipped: Vec<String>,
    /// Row-level problems that did not stop the fetch.
    pub errors: Vec<String>,
}

fn id_of(value: &Value) -> Option<String> {
    value.get("Id").and_then(Value::as_str).map(str::to_string)
}

/// Fetch opportunities with all of their line items.
///
/// A row that does not decode only costs that row: an opportunity is
/// skipped, a line item with an `Id` becomes a [`RejectedItem`], and one
/// without is noted in [`Fetched::errors`].
pub async fn fetch_opportunities(api: &dyn DataApi, ids: &[String]) -> Result<Fetched, ServiceError> {
    let soql = opportunities_query(ids)?;
    let rows = query_all(api, &soql).await?;

    let mut fetched = Fetched::default();
    for value in rows {
        let id = id_of(&value);
        let row: OpportunityRow = match decode(value) {
            Ok(row) => row,
            Err(e) => {
                warn!(opportunity = ?id, error = %e, "skipping undecodable opportunity");
                match id {
                    Some(id) => {
                        fetched.errors.push(format!("opportunity {id} skipped: {e}"));
                        fetched.skipped.push(id);
                    }
                    None => fetched.errors.push(format!("opportunity row skipped: {e}")),
                }
                continue;
            }
        };

        let mut parent = ParentRecord {
            id: row.id,
            name: row.name,
            line_items: Vec::new(),
            rejected_items: Vec::new(),
        };
        if let Some(nested) = row.opportunity_line_items {
            add_children(&mut parent, nested.records, &mut fetched.errors);
            let mut done = nested.done;
            let mut next = nested.next_records_url;
            while !done {
                let url = next.take().ok_or_else(|| {
                    ServiceError::Upstream(format!(
                        "line items of {} not done but have no nextRecordsUrl",
                        parent.id
                    ))
                })?;
                let page = api.query_more(&url).await?;
                add_children(&mut parent, page.records, &mut fetched.errors);
                done = page.done;
                next = page.next_records_url;
            }
        }
        fetched.parents.push(parent);
    }
    Ok(fetched)
}

fn add_children(parent: &mut ParentRecord, records: Vec<Value>, errors: &mut Vec<String>) {
    for value in records {
        let id = id_of(&value);
        match decode::<LineItemRow>(value) {
            Ok(row) => parent.line_items.push(row.into()),
            Err(e) => {
                warn!(opportunity = %parent.id, line_item = ?id, error = %e, "undecodable line item");
                match id {
                    Some(id) => parent.rejected_items.push(RejectedItem {
                        id,
                        reason: e.to_string(),
                    }),
                    None => errors.push(format!("line item of {} skipped: {e}", parent.id)),
                }
            }
        }
    }
}
