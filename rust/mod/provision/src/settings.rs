use applink_core::{DataApi, ServiceError};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::soql;

pub const DEFAULT_TIER: &str = "standard";
pub const DEFAULT_REGION: &str = "us-east";
pub const DEFAULT_COMPLIANCE: &str = "none";

/// Named tuning values read from the org's settings object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub tier: String,
    pub region: String,
    pub compliance: String,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            tier: DEFAULT_TIER.to_string(),
            region: DEFAULT_REGION.to_string(),
            compliance: DEFAULT_COMPLIANCE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingRow {
    developer_name: String,
    #[serde(rename = "Value__c", default)]
    value: Option<String>,
}

impl ProvisionSettings {
    /// Overlay `(name, value)` pairs on the defaults. Unknown names and
    /// blank values are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut settings = Self::default();
        for (name, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match name {
                "Tier" => settings.tier = value.to_string(),
                "Region" => settings.region = value.to_string(),
                "Compliance" => settings.compliance = value.to_string(),
                other => debug!(setting = other, "ignoring unknown provisioning setting"),
            }
        }
        settings
    }
}

fn settings_query(object: &str) -> Result<String, ServiceError> {
    let valid = !object.is_empty()
        && object
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !valid {
        return Err(ServiceError::Validation(format!(
            "invalid settings object name: {object:?}"
        )));
    }
    Ok(format!("SELECT DeveloperName, Value__c FROM {object}"))
}

/// Strict lookup: any query or decode failure is returned.
pub async fn fetch(api: &dyn DataApi, object: &str) -> Result<ProvisionSettings, ServiceError> {
    let query = settings_query(object)?;
    let records = soql::query_all(api, &query).await?;
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let row: SettingRow = serde_json::from_value(record)
            .map_err(|e| ServiceError::Upstream(format!("unexpected setting shape: {e}")))?;
        rows.push(row);
    }
    Ok(ProvisionSettings::from_pairs(rows.iter().map(|r| {
        (r.developer_name.as_str(), r.value.as_deref().unwrap_or(""))
    })))
}

/// Lookup that never fails the job: errors degrade to the defaults.
pub async fn fetch_or_default(api: &dyn DataApi, object: &str) -> ProvisionSettings {
    match fetch(api, object).await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, object, "settings lookup failed, using defaults");
            ProvisionSettings::default()
        }
    }
}
