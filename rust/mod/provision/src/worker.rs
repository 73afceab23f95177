use std::sync::Arc;
use std::time::Duration;

use applink_core::{DataApi, OutboundRequest, ServiceError};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::model::{
    CallbackPayload, JobSummary, ProvisioningJob, ServiceResult, ServiceStatus,
};
use crate::provisioner::{Provisioner, SimulatedProvisioner};
use crate::{record_id, settings, soql};

/// Worker tuning, built once at startup.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Simulated time spent per line item.
    pub item_delay: Duration,
    /// Deadline for a whole job. `None` lets jobs run to completion.
    pub job_timeout: Option<Duration>,
    /// Custom metadata object holding the tuning settings.
    pub settings_object: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            item_delay: Duration::from_millis(1500),
            job_timeout: None,
            settings_object: "Provisioning_Setting__mdt".to_string(),
        }
    }
}

/// Longest callback response body written to the log.
const MAX_LOGGED_BODY: usize = 512;

/// At most `max` bytes of `s`, cut back to a char boundary.
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// How a job ended. Only used for logging and tests; nothing is retained.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job named no record ids.
    NoRecordIds,
    /// Nothing was provisioned, so no callback was sent.
    NoResults,
    /// Results were produced but the caller gave no callback address.
    NoCallback(JobSummary),
    /// The callback sink answered with a 2xx status.
    Delivered(JobSummary),
    /// The callback failed or answered non-2xx. Not retried.
    DeliveryFailed(JobSummary),
}

/// Runs provisioning jobs as detached tasks.
///
/// Jobs are not queued or pooled: every accepted submission gets its own
/// task. The tracker only exists so `/health` can report how many are in
/// flight and shutdown can wait for them.
#[derive(Clone)]
pub struct ProvisionWorker {
    config: Arc<ProvisionConfig>,
    provisioner: Arc<dyn Provisioner>,
    tracker: TaskTracker,
}

impl ProvisionWorker {
    pub fn new(config: ProvisionConfig) -> Self {
        let provisioner = Arc::new(SimulatedProvisioner::new(config.item_delay));
        Self::with_provisioner(config, provisioner)
    }

    pub fn with_provisioner(config: ProvisionConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            config: Arc::new(config),
            provisioner,
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Number of jobs still running.
    pub fn active_jobs(&self) -> usize {
        self.tracker.len()
    }

    /// Detach `job`. Returns immediately; the job's outcome is only logged.
    ///
    /// The job body runs in its own task so that a panic is caught by the
    /// supervising task and logged instead of being lost.
    pub fn spawn(&self, job: ProvisioningJob, api: Arc<dyn DataApi>) {
        let worker = self.clone();
        let job_id = job.job_id.clone();
        self.tracker.spawn(async move {
            let handle = tokio::spawn(async move { worker.run(job, api).await });
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(job_id = %job_id, "provisioning job panicked");
                } else {
                    warn!(job_id = %job_id, "provisioning job was cancelled");
                }
            }
        });
    }

    /// Wait up to `grace` for running jobs. Returns `true` if every job
    /// finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let running = self.tracker.len();
        if running > 0 {
            info!(running, ?grace, "waiting for provisioning jobs");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "shutdown grace period expired with jobs still running"
                );
                false
            }
        }
    }

    /// Error boundary of a job. Nothing escapes: every failure is logged
    /// with the job id.
    pub async fn run(&self, job: ProvisioningJob, api: Arc<dyn DataApi>) {
        let span = info_span!("provision_job", job_id = %job.job_id);
        async {
            let started = tokio::time::Instant::now();
            let result = match self.config.job_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.execute(&job, api.as_ref())).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(job_id = %job.job_id, ?limit, "job timed out, no callback sent");
                            return;
                        }
                    }
                }
                None => self.execute(&job, api.as_ref()).await,
            };
            match result {
                Ok(outcome) => info!(
                    job_id = %job.job_id,
                    ?outcome,
                    elapsed = ?started.elapsed(),
                    "job finished"
                ),
                Err(e) => error!(
                    job_id = %job.job_id,
                    code = e.error_code(),
                    error = %e,
                    "job failed"
                ),
            }
        }
        .instrument(span)
        .await
    }

    /// The job pipeline: settings, id sanitization, fetch, per-item
    /// provisioning, aggregation and callback delivery.
    pub async fn execute(
        &self,
        job: &ProvisioningJob,
        api: &dyn DataApi,
    ) -> Result<JobOutcome, ServiceError> {
        if job.requested_record_ids.is_empty() {
            warn!(job_id = %job.job_id, "job has no record ids, nothing to do");
            return Ok(JobOutcome::NoRecordIds);
        }

        let settings = settings::fetch_or_default(api, &self.config.settings_object).await;
        debug!(job_id = %job.job_id, ?settings, "provisioning settings");

        let mut errors = Vec::new();
        let (ids, rejected) = record_id::partition(&job.requested_record_ids);
        if !rejected.is_empty() {
            warn!(job_id = %job.job_id, rejected = rejected.len(), "dropping malformed record ids");
            errors.push(format!("{} malformed record id(s) ignored", rejected.len()));
        }
        if ids.is_empty() {
            warn!(job_id = %job.job_id, "no well-formed record ids, skipping fetch");
            return Ok(JobOutcome::NoResults);
        }

        let fetched = soql::fetch_opportunities(api, &ids).await?;
        let parents = fetched.parents;
        info!(job_id = %job.job_id, parents = parents.len(), "fetched opportunities");
        errors.extend(fetched.errors);
        for id in &ids {
            let mut returned = parents
                .iter()
                .map(|p| p.id.as_str())
                .chain(fetched.skipped.iter().map(String::as_str));
            if !returned.any(|r| record_id::same_record(r, id)) {
                errors.push(format!("record {id} not found"));
            }
        }

        let prefix = job.job_id.get(..8).unwrap_or(&job.job_id);
        let mut seq = 0u32;
        let mut services: Vec<ServiceResult> = Vec::new();
        for parent in &parents {
            for item in &parent.line_items {
                seq += 1;
                let (status, message) = match self
                    .provisioner
                    .provision(&parent.id, item, &settings)
                    .await
                {
                    Ok(message) => (ServiceStatus::Provisioned, message),
                    Err(message) => {
                        warn!(job_id = %job.job_id, line_item = %item.id, %message, "line item failed");
                        (ServiceStatus::Failed, message)
                    }
                };
                services.push(ServiceResult {
                    service_id: format!("svc-{prefix}-{seq:04}"),
                    opportunity_id: parent.id.clone(),
                    line_item_id: item.id.clone(),
                    product_reference: item.product_reference(),
                    status,
                    message,
                });
            }
            for rejected in &parent.rejected_items {
                seq += 1;
                services.push(ServiceResult {
                    service_id: format!("svc-{prefix}-{seq:04}"),
                    opportunity_id: parent.id.clone(),
                    line_item_id: rejected.id.clone(),
                    product_reference: "unknown product".to_string(),
                    status: ServiceStatus::Failed,
                    message: format!("line item could not be read: {}", rejected.reason),
                });
            }
        }

        if services.is_empty() {
            warn!(job_id = %job.job_id, "no line items provisioned, skipping callback");
            return Ok(JobOutcome::NoResults);
        }

        let payload = CallbackPayload::new(job, services, errors);
        let summary = payload.summary;
        info!(
            job_id = %job.job_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "provisioning complete"
        );

        let Some(url) = job.callback_address.as_deref() else {
            info!(job_id = %job.job_id, "no callback address, results only logged");
            return Ok(JobOutcome::NoCallback(summary));
        };

        let body = serde_json::to_value(&payload)?;
        match api.request(url, OutboundRequest::post_json(body)).await {
            Ok(resp) if resp.is_success() => {
                info!(job_id = %job.job_id, status = resp.status, "callback delivered");
                Ok(JobOutcome::Delivered(summary))
            }
            Ok(resp) => {
                error!(
                    job_id = %job.job_id,
                    status = resp.status,
                    body = truncated(&resp.body, MAX_LOGGED_BODY),
                    "callback rejected, not retrying"
                );
                Ok(JobOutcome::DeliveryFailed(summary))
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "callback failed, not retrying");
                Ok(JobOutcome::DeliveryFailed(summary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineItem;
    use crate::settings::ProvisionSettings;
    use crate::testing::{line_item_json, opportunity_json, FakeOrg};
    use async_trait::async_trait;
    use serde_json::json;

    const OPP: &str = "006000000000001AAA";

    fn worker() -> ProvisionWorker {
        ProvisionWorker::new(ProvisionConfig {
            item_delay: Duration::ZERO,
            ..ProvisionConfig::default()
        })
    }

    fn job(ids: &[&str], callback: Option<&str>) -> ProvisioningJob {
        ProvisioningJob {
            job_id: "0123456789abcdef0123456789abcdef".into(),
            requested_record_ids: ids.iter().map(|s| s.to_string()).collect(),
            callback_address: callback.map(str::to_string),
        }
    }

    fn two_children() -> FakeOrg {
        FakeOrg::new().with_page(json!({
            "totalSize": 1, "done": true,
            "records": [opportunity_json(OPP, &[
                line_item_json("00k000000000001AAA", "Edge Gateway", 2.0),
                line_item_json("00k000000000002AAA", "Cloud Backup", 1.0),
            ])],
        }))
    }

    #[tokio::test]
    async fn test_one_parent_two_children_one_callback() {
        let org = two_children();
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Delivered(_)));

        let requests = org.requests();
        assert_eq!(requests.len(), 1);
        let (url, req) = &requests[0];
        assert_eq!(url, "https://example.test/cb");
        assert_eq!(req.method, axum::http::Method::POST);

        let body = req.body.as_ref().unwrap();
        assert_eq!(body["jobId"], "0123456789abcdef0123456789abcdef");
        assert_eq!(body["services"].as_array().unwrap().len(), 2);
        assert_eq!(body["summary"], json!({"total": 2, "succeeded": 2, "failed": 0}));
        assert_eq!(body["status"], "completed");
        assert_eq!(body["services"][0]["serviceId"], "svc-01234567-0001");
        assert_eq!(body["services"][1]["serviceId"], "svc-01234567-0002");
        assert_eq!(body["services"][1]["opportunityId"], OPP);
    }

    #[tokio::test]
    async fn test_empty_ids_do_nothing() {
        let org = two_children();
        let outcome = worker().execute(&job(&[], Some("https://example.test/cb")), &org).await.unwrap();
        assert_eq!(outcome, JobOutcome::NoRecordIds);
        assert!(org.queries().is_empty());
        assert!(org.requests().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_ids_never_reach_the_query() {
        let org = two_children();
        let bad = "006' OR Name != '";
        let outcome = worker()
            .execute(&job(&[bad, OPP, "001ABCDEFGHIJKLMN"], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Delivered(_)));

        let queries = org.queries();
        let record_query = queries.iter().find(|q| q.contains("FROM Opportunity")).unwrap();
        assert!(record_query.ends_with(&format!("IN ('{OPP}')")));
        assert!(!queries.iter().any(|q| q.contains(bad) || q.contains("001ABCDEFGHIJKLMN")));

        let (_, req) = &org.requests()[0];
        let body = req.body.as_ref().unwrap();
        for service in body["services"].as_array().unwrap() {
            assert_eq!(service["opportunityId"], OPP);
        }
        assert_eq!(body["errors"], json!(["2 malformed record id(s) ignored"]));
    }

    #[tokio::test]
    async fn test_only_malformed_ids_skip_fetch() {
        let org = two_children();
        let outcome = worker()
            .execute(&job(&["001ABCDEFGHIJKLMN"], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::NoResults);
        assert!(!org.queries().iter().any(|q| q.contains("FROM Opportunity")));
        assert!(org.requests().is_empty());
    }

    #[tokio::test]
    async fn test_zero_children_means_no_callback() {
        let org = FakeOrg::new().with_page(json!({
            "done": true,
            "records": [opportunity_json(OPP, &[])],
        }));
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::NoResults);
        assert!(org.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_callback_address_sends_nothing() {
        let org = two_children();
        let outcome = worker().execute(&job(&[OPP], None), &org).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::NoCallback(JobSummary { total: 2, succeeded: 2, failed: 0 })
        );
        assert!(org.requests().is_empty());
    }

    #[tokio::test]
    async fn test_callback_failure_is_absorbed() {
        let org = two_children().failing_requests();
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::DeliveryFailed(_)));
        assert_eq!(org.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_rejection_is_not_retried() {
        let org = two_children().with_request_status(503);
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::DeliveryFailed(_)));
        assert_eq!(org.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_item_is_reported_not_dropped() {
        let org = FakeOrg::new().with_page(json!({
            "done": true,
            "records": [opportunity_json(OPP, &[
                line_item_json("00k000000000001AAA", "Edge Gateway", 1.0),
                line_item_json("00k000000000002AAA", "Cloud Backup", 0.0),
            ])],
        }));
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Delivered(JobSummary { total: 2, succeeded: 1, failed: 1 })
        );
        let (_, req) = &org.requests()[0];
        let body = req.body.as_ref().unwrap();
        assert_eq!(body["status"], "partial");
        assert_eq!(body["services"][1]["status"], "Failed");
        assert_eq!(body["services"][1]["lineItemId"], "00k000000000002AAA");
    }

    #[tokio::test]
    async fn test_settings_failure_degrades_to_defaults() {
        let org = two_children().failing_settings();
        let outcome = worker().execute(&job(&[OPP], Some("/services/apexrest/cb")), &org).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        let (url, req) = &org.requests()[0];
        assert_eq!(url, "/services/apexrest/cb");
        let message = req.body.as_ref().unwrap()["services"][0]["message"].as_str().unwrap().to_string();
        assert!(message.contains("standard tier"), "{message}");
    }

    #[tokio::test]
    async fn test_settings_flow_into_messages() {
        let org = two_children().with_settings(json!([
            {"DeveloperName": "Tier", "Value__c": "premium"},
            {"DeveloperName": "Region", "Value__c": "eu-west"},
        ]));
        worker().execute(&job(&[OPP], Some("https://example.test/cb")), &org).await.unwrap();
        let (_, req) = &org.requests()[0];
        let message = req.body.as_ref().unwrap()["services"][0]["message"].as_str().unwrap().to_string();
        assert!(message.contains("premium tier, eu-west"), "{message}");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_listed_in_errors() {
        let org = two_children();
        let missing = "006000000000009AAA";
        worker()
            .execute(&job(&[OPP, missing], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        let (_, req) = &org.requests()[0];
        assert_eq!(
            req.body.as_ref().unwrap()["errors"],
            json!([format!("record {missing} not found")])
        );
    }

    #[tokio::test]
    async fn test_query_failure_surfaces_as_error() {
        let org = FakeOrg::new().failing_queries();
        let err = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert!(org.requests().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_jobs_are_tracked_until_done() {
        let org = Arc::new(two_children());
        let worker = worker();
        worker.spawn(job(&[OPP], Some("https://example.test/cb")), org.clone());
        worker.spawn(job(&[OPP], None), Arc::new(FakeOrg::new().failing_queries()));
        assert!(worker.shutdown(Duration::from_secs(5)).await);
        assert_eq!(worker.active_jobs(), 0);
        assert_eq!(org.requests().len(), 1);
    }

    struct Exploding;

    #[async_trait]
    impl Provisioner for Exploding {
        async fn provision(&self, _: &str, _: &LineItem, _: &ProvisionSettings) -> Result<String, String> {
            panic!("provisioning backend exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let org = Arc::new(two_children());
        let worker = ProvisionWorker::with_provisioner(ProvisionConfig::default(), Arc::new(Exploding));
        worker.spawn(job(&[OPP], Some("https://example.test/cb")), org.clone());
        assert!(worker.shutdown(Duration::from_secs(5)).await);
        assert!(org.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_job_sends_no_callback() {
        let org = Arc::new(two_children());
        let worker = ProvisionWorker::new(ProvisionConfig {
            item_delay: Duration::from_secs(60),
            job_timeout: Some(Duration::from_secs(5)),
            ..ProvisionConfig::default()
        });
        worker.run(job(&[OPP], Some("https://example.test/cb")), org.clone()).await;
        assert!(org.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace() {
        let worker = ProvisionWorker::new(ProvisionConfig {
            item_delay: Duration::from_secs(600),
            ..ProvisionConfig::default()
        });
        worker.spawn(job(&[OPP], None), Arc::new(two_children()));
        tokio::task::yield_now().await;
        assert_eq!(worker.active_jobs(), 1);
        assert!(!worker.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_short_id_matches_long_form() {
        let org = two_children();
        let outcome = worker()
            .execute(&job(&["006000000000001"], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        let (_, req) = &org.requests()[0];
        let body = req.body.as_ref().unwrap();
        assert_eq!(body["errors"], json!([]));
        assert_eq!(body["services"][0]["opportunityId"], OPP);
    }

    #[tokio::test]
    async fn test_checksum_case_does_not_matter() {
        let org = two_children();
        worker()
            .execute(&job(&["006000000000001aaa"], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        let (_, req) = &org.requests()[0];
        assert_eq!(req.body.as_ref().unwrap()["errors"], json!([]));
    }

    #[tokio::test]
    async fn test_undecodable_item_fails_alone() {
        let mut bad = line_item_json("00k000000000002AAA", "Cloud Backup", 1.0);
        bad["Quantity"] = json!({"value": 1});
        let org = FakeOrg::new().with_page(json!({
            "done": true,
            "records": [opportunity_json(OPP, &[
                line_item_json("00k000000000001AAA", "Edge Gateway", 2.0),
                bad,
            ])],
        }));
        let outcome = worker()
            .execute(&job(&[OPP], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Delivered(JobSummary { total: 2, succeeded: 1, failed: 1 })
        );
        let (_, req) = &org.requests()[0];
        let body = req.body.as_ref().unwrap();
        assert_eq!(body["status"], "partial");
        assert_eq!(body["services"][0]["status"], "Provisioned");
        assert_eq!(body["services"][1]["status"], "Failed");
        assert_eq!(body["services"][1]["lineItemId"], "00k000000000002AAA");
        assert_eq!(body["services"][1]["serviceId"], "svc-01234567-0002");
        let message = body["services"][1]["message"].as_str().unwrap();
        assert!(message.starts_with("line item could not be read"), "{message}");
    }

    #[tokio::test]
    async fn test_undecodable_parent_is_not_reported_missing() {
        let org = FakeOrg::new().with_page(json!({
            "done": true,
            "records": [
                opportunity_json(OPP, &[line_item_json("00k000000000001AAA", "Edge Gateway", 1.0)]),
                {"Id": "006000000000002AAA", "Name": ["not", "a", "name"]},
            ],
        }));
        worker()
            .execute(&job(&[OPP, "006000000000002AAA"], Some("https://example.test/cb")), &org)
            .await
            .unwrap();
        let (_, req) = &org.requests()[0];
        let errors = req.body.as_ref().unwrap()["errors"].as_array().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().starts_with("opportunity 006000000000002AAA skipped"));
    }

    #[test]
    fn test_logged_body_is_bounded() {
        assert_eq!(truncated("short", MAX_LOGGED_BODY), "short");
        let long = "x".repeat(MAX_LOGGED_BODY * 4);
        assert_eq!(truncated(&long, MAX_LOGGED_BODY).len(), MAX_LOGGED_BODY);
        // "é" is two bytes; a cut at 3 would split the second one.
        assert_eq!(truncated("éé", 3), "é");
        assert_eq!(truncated("éé", 4), "éé");
    }
}
