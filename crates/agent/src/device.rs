use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sharecast_protocol::DeviceConfig;
use tracing::debug;

const DMI_DIR: &str = "/sys/class/dmi/id";

/// Manufacturer and model used to build device identifiers.
#[derive(Debug)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub enterprise_id: Option<String>,
    last_millis: AtomicU64,
}

impl DeviceIdentity {
    pub fn new(
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        enterprise_id: Option<String>,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            enterprise_id,
            last_millis: AtomicU64::new(0),
        }
    }

    /// Config values win; missing ones come from DMI, then `unknown`.
    pub fn detect(config: &DeviceConfig) -> Self {
        Self::resolve(config, Path::new(DMI_DIR))
    }

    fn resolve(config: &DeviceConfig, dmi_dir: &Path) -> Self {
        let manufacturer = config
            .manufacturer
            .clone()
            .or_else(|| read_dmi(dmi_dir, "sys_vendor"))
            .unwrap_or_else(|| "unknown".to_string());
        let model = config
            .model
            .clone()
            .or_else(|| read_dmi(dmi_dir, "product_name"))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(
            manufacturer,
            model,
            config.enterprise_id.clone().filter(|e| !e.trim().is_empty()),
        )
    }

    /// A fresh identifier for a new session. The timestamp never repeats,
    /// even for two sessions started within the same millisecond.
    pub fn next_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let prev = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let millis = now.max(prev + 1);
        compose_device_id(
            &self.manufacturer,
            &self.model,
            millis as u128,
            self.enterprise_id.as_deref(),
        )
    }
}

fn read_dmi(dir: &Path, field: &str) -> Option<String> {
    match std::fs::read_to_string(dir.join(field)) {
        Ok(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
        Err(e) => {
            debug!(field, "DMI field unavailable: {e}");
            None
        }
    }
}

/// `{manufacturer}-{model}-{millis}[-{enterprise}]` with spaces replaced by
/// underscores.
pub fn compose_device_id(
    manufacturer: &str,
    model: &str,
    millis: u128,
    enterprise_id: Option<&str>,
) -> String {
    let mut id = format!("{}-{}-{millis}", manufacturer.trim(), model.trim());
    if let Some(enterprise) = enterprise_id {
        id.push('-');
        id.push_str(enterprise.trim());
    }
    id.replace(' ', "_")
}
