use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Body of `POST /provisionServices`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub requested_record_ids: Vec<String>,
    #[serde(default)]
    pub callback_address: Option<String>,
}

/// Synchronous answer for an accepted submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    pub job_id: String,
    pub status: &'static str,
}

/// One accepted submission. Immutable for the job's lifetime.
#[derive(Debug, Clone)]
pub struct ProvisioningJob {
    pub job_id: String,
    pub requested_record_ids: Vec<String>,
    pub callback_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An opportunity together with its line items.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRecord {
    pub id: String,
    pub name: Option<String>,
    pub line_items: Vec<LineItem>,
    /// Children that carried an `Id` but could not be decoded.
    pub rejected_items: Vec<RejectedItem>,
}

/// A line item row the org returned in a shape we cannot use.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedItem {
    pub id: String,
    pub reason: String,
}

/// One opportunity line item: the unit of provisioning work.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub id: String,
    pub product_name: Option<String>,
    pub quantity: f64,
    pub unit_price: f64,
    pub pricebook_entry_id: Option<String>,
}

impl LineItem {
    /// Label used as `productReference` in results.
    pub fn product_reference(&self) -> String {
        self.product_name
            .clone()
            .or_else(|| self.pricebook_entry_id.clone())
            .unwrap_or_else(|| "unknown product".to_string())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Provisioned,
    Failed,
}

/// Outcome of provisioning exactly one line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult {
    pub service_id: String,
    pub opportunity_id: String,
    pub line_item_id: String,
    pub product_reference: String,
    pub status: ServiceStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobSummary {
    /// Derive the summary from the result list.
    pub fn from_results(results: &[ServiceResult]) -> Self {
        let succeeded = results
            .iter()
            .filter(|r| r.status == ServiceStatus::Provisioned)
            .count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }

    pub fn job_status(&self) -> JobStatus {
        if self.failed == 0 {
            JobStatus::Completed
        } else if self.succeeded == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Partial,
    Failed,
}

/// Body POSTed to the callback address. Built once, sent at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub job_id: String,
    pub requested_record_ids: Vec<String>,
    pub services: Vec<ServiceResult>,
    pub summary: JobSummary,
    pub status: JobStatus,
    pub errors: Vec<String>,
}

impl CallbackPayload {
    pub fn new(job: &ProvisioningJob, services: Vec<ServiceResult>, errors: Vec<String>) -> Self {
        let summary = JobSummary::from_results(&services);
        Self {
            job_id: job.job_id.clone(),
            requested_record_ids: job.requested_record_ids.clone(),
            status: summary.job_status(),
            summary,
            services,
            errors,
        }
    }
}
