use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use tracing::info;
use url::Url;

use applink_core::{new_id, ClientContext, ServiceError};

use crate::model::{ProvisionAccepted, ProvisionRequest, ProvisioningJob};
use crate::worker::ProvisionWorker;

/// Routes:
/// - `POST /provisionServices`: accept a job, answer 201 with its id
pub fn router(worker: ProvisionWorker) -> Router {
    Router::new()
        .route("/provisionServices", post(provision_services))
        .with_state(worker)
}

/// Accept either an absolute http(s) URL or a path on the org domain.
fn validate_callback(address: &str) -> Result<(), ServiceError> {
    if address.starts_with('/') && !address.starts_with("//") {
        return Ok(());
    }
    match Url::parse(address) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        Ok(url) => Err(ServiceError::Validation(format!(
            "callbackAddress must use http or https, got {:?}",
            url.scheme()
        ))),
        Err(e) => Err(ServiceError::Validation(format!(
            "callbackAddress is not a valid URL: {e}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// POST /provisionServices
// ---------------------------------------------------------------------------

async fn provision_services(
    State(worker): State<ProvisionWorker>,
    ctx: Option<Extension<ClientContext>>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionAccepted>), ServiceError> {
    let Some(Extension(ctx)) = ctx else {
        return Err(ServiceError::Unauthorized("client context is missing".into()));
    };
    let api = ctx.require_data_api()?;

    let Json(req) = body.map_err(|e| ServiceError::Validation(e.body_text()))?;
    if req.requested_record_ids.is_empty() {
        return Err(ServiceError::Validation(
            "requestedRecordIds must not be empty".into(),
        ));
    }
    let callback_address = req
        .callback_address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    if let Some(address) = &callback_address {
        validate_callback(address)?;
    }

    let job = ProvisioningJob {
        job_id: new_id(),
        requested_record_ids: req.requested_record_ids,
        callback_address,
    };
    info!(
        job_id = %job.job_id,
        org_id = %ctx.org_id,
        request_id = %ctx.request_id,
        records = job.requested_record_ids.len(),
        callback = job.callback_address.is_some(),
        "provisioning job accepted"
    );

    let accepted = ProvisionAccepted {
        job_id: job.job_id.clone(),
        status: "accepted",
    };
    worker.spawn(job, api);
    Ok((StatusCode::CREATED, Json(accepted)))
}
