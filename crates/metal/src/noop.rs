//! Driver for systems without a controllable power path

use async_trait::async_trait;
use metalboot_common::{Appliance, Result};
use regex::Regex;
use tracing::info;

use crate::{EnlistResult, Metal, SystemAppliance};

pub struct NoopMetal;

#[async_trait]
impl Metal for NoopMetal {
    async fn enlist(&self, appliance: &Appliance, _pattern: &Regex) -> Result<Vec<EnlistResult>> {
        info!(appliance = %appliance.name, "noop operation: enlist");
        Ok(Vec::new())
    }

    async fn boot_network(&self, target: &SystemAppliance) -> Result<()> {
        info!(system_id = target.system.id, "noop operation: boot network");
        Ok(())
    }

    async fn boot_local(&self, target: &SystemAppliance) -> Result<()> {
        info!(system_id = target.system.id, "noop operation: boot local");
        Ok(())
    }
}
