//! Last-resort re-enable when the lock controller is lost
//!
//! The controller normally re-enables keys itself on Exit. If its task dies
//! instead, whatever is attached right now gets enabled so no key stays
//! disabled after the daemon is gone.

use tracing::{error, info, warn};

use crate::device::{DeviceBackend, DeviceError, DeviceSet};

/// Enable every currently attached security key
pub async fn reenable_attached(backend: &dyn DeviceBackend) -> Result<DeviceSet, DeviceError> {
    let devices = backend.enumerate().await.map_err(|e| {
        error!(error = %e, "cannot enumerate security keys for fail-safe re-enable");
        e
    })?;

    if devices.is_empty() {
        warn!("fail-safe re-enable found no security keys");
        return Ok(devices);
    }

    backend.enable(&devices).await?;
    info!(devices = %devices, "fail-safe re-enabled security keys");
    Ok(devices)
}
