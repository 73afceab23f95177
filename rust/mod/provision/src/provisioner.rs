use std::time::Duration;

use async_trait::async_trait;

use crate::model::LineItem;
use crate::settings::ProvisionSettings;

/// Performs the provisioning action for one line item.
///
/// `Ok` carries the success message, `Err` the failure message. Either way
/// the worker records exactly one result for the item.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(
        &self,
        opportunity_id: &str,
        item: &LineItem,
        settings: &ProvisionSettings,
    ) -> Result<String, String>;
}

/// Stand-in for a real provisioning backend: waits, then reports success.
#[derive(Debug, Clone)]
pub struct SimulatedProvisioner {
    delay: Duration,
}

impl SimulatedProvisioner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn provision(
        &self,
        _opportunity_id: &str,
        item: &LineItem,
        settings: &ProvisionSettings,
    ) -> Result<String, String> {
        if item.quantity.is_nan() || item.quantity <= 0.0 {
            return Err(format!(
                "cannot provision {} with quantity {}",
                item.product_reference(),
                item.quantity
            ));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!(
            "Provisioned {} x {} ({} tier, {}, compliance: {})",
            item.quantity,
            item.product_reference(),
            settings.tier,
            settings.region,
            settings.compliance
        ))
    }
}
