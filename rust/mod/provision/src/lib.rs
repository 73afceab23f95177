pub mod api;
pub mod model;
pub mod provisioner;
pub mod record_id;
pub mod settings;
pub mod soql;
pub mod worker;

#[cfg(test)]
mod testing;

use axum::Router;
use applink_core::Module;

use worker::{ProvisionConfig, ProvisionWorker};

/// The provisioning module: job submission endpoint plus detached worker.
pub struct ProvisionModule {
    worker: ProvisionWorker,
}

impl ProvisionModule {
    /// Create the module with the simulated provisioner.
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            worker: ProvisionWorker::new(config),
        }
    }

    /// Handle to the worker, for health reporting and shutdown.
    pub fn worker(&self) -> &ProvisionWorker {
        &self.worker
    }
}

impl Module for ProvisionModule {
    fn name(&self) -> &str {
        "provision"
    }

    fn routes(&self) -> Router {
        api::router(self.worker.clone())
    }
}
