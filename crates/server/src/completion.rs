//! Completion handler
//!
//! The installer reports success by installation UUID. The installation is
//! moved to `Finished` and, when the system has an appliance, a deferred
//! local-boot power cycle is queued.

use metalboot_common::{Error, Installation, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::lifecycle::Lifecycle;
use crate::power::{PowerAction, PowerQueue};
use crate::storage::Store;

pub struct CompletionHandler {
    lifecycle: Arc<Lifecycle>,
    store: Arc<dyn Store>,
    power: PowerQueue,
    delay: Duration,
}

impl CompletionHandler {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        store: Arc<dyn Store>,
        power: PowerQueue,
        delay: Duration,
    ) -> Self {
        Self {
            lifecycle,
            store,
            power,
            delay,
        }
    }

    /// Handle a completion signal for the raw UUID taken from the URL.
    ///
    /// Once the installation is `Finished` the signal has succeeded; failing
    /// to queue the power action afterwards is logged, not returned.
    pub async fn complete(&self, raw_uuid: &str) -> Result<Installation> {
        let uuid = Uuid::parse_str(raw_uuid)
            .map_err(|e| Error::NotFound(format!("installation '{}': {}", raw_uuid, e)))?;

        let installation = self.lifecycle.finish(uuid).await?;
        info!(
            install_uuid = %uuid,
            system_id = installation.system_id,
            "installation done"
        );

        if let Err(e) = self.boot_locally(installation.system_id).await {
            error!(
                install_uuid = %uuid,
                system_id = installation.system_id,
                error = %e,
                "cannot schedule local boot"
            );
        }
        Ok(installation)
    }

    async fn boot_locally(&self, system_id: i64) -> Result<()> {
        let system = self
            .store
            .find_system_by_id(system_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("system {}", system_id)))?;

        if system.appliance_id.is_none() {
            info!(
                system_id = system.id,
                "system has no appliance associated, not booting locally"
            );
            return Ok(());
        }

        info!(
            system_id = system.id,
            delay_secs = self.delay.as_secs(),
            "will boot system locally"
        );
        self.power
            .schedule(PowerAction::BootLocal, system.id, self.delay)
    }
}
