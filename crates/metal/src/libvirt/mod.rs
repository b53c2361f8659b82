//! Libvirt driver

pub mod domain;
pub mod virsh;

use async_trait::async_trait;
use metalboot_common::{Appliance, Result};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{parse_hw_addrs, EnlistResult, Metal, SystemAppliance};
pub use domain::{set_boot_device, BootDevice, DomainDescriptor};
pub use virsh::{connection_uri, Connector, Hypervisor, VirshConnector};

pub struct LibvirtMetal {
    connector: Arc<dyn Connector>,
}

impl LibvirtMetal {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    async fn boot_device(&self, target: &SystemAppliance, device: BootDevice) -> Result<()> {
        let (appliance, uid) = target.controlled()?;
        let hypervisor = self.connector.connect(&appliance.uri).await?;

        let xml = hypervisor.domain_xml(uid).await?;
        let updated = set_boot_device(&xml, device)?;
        hypervisor.define_xml(&updated).await?;

        // a domain that never ran cannot be reset
        if hypervisor.is_running(uid).await? {
            info!(uid, device = %device, "force resetting domain");
            hypervisor.reset(uid).await
        } else {
            info!(uid, device = %device, "starting domain");
            hypervisor.start(uid).await
        }
    }
}

#[async_trait]
impl Metal for LibvirtMetal {
    async fn enlist(&self, appliance: &Appliance, pattern: &Regex) -> Result<Vec<EnlistResult>> {
        let hypervisor = self.connector.connect(&appliance.uri).await?;
        let uuids = hypervisor.list_domains().await?;
        debug!(count = uuids.len(), appliance = %appliance.name, "listed libvirt domains");

        let mut result = Vec::new();
        for uuid in uuids {
            let xml = hypervisor.domain_xml(&uuid).await?;
            let domain = DomainDescriptor::parse(&xml)?;

            if !pattern.is_match(&domain.name) {
                info!(
                    pattern = pattern.as_str(),
                    appliance = %appliance.name,
                    name = %domain.name,
                    uuid = %uuid,
                    "system does not match the pattern"
                );
                continue;
            }

            let hw_addrs = parse_hw_addrs(domain.hw_addrs.iter().map(String::as_str));
            let uid = if domain.uuid.is_empty() {
                uuid
            } else {
                domain.uuid.clone()
            };
            info!(
                mac = %domain.hw_addrs.join(","),
                uuid = %uid,
                appliance = %appliance.name,
                name = %domain.name,
                "found system"
            );

            result.push(EnlistResult {
                hw_addrs,
                facts: domain.facts(),
                uid,
            });
        }

        Ok(result)
    }

    async fn boot_network(&self, target: &SystemAppliance) -> Result<()> {
        self.boot_device(target, BootDevice::Network).await
    }

    async fn boot_local(&self, target: &SystemAppliance) -> Result<()> {
        self.boot_device(target, BootDevice::Disk).await
    }

    fn controls_power(&self) -> bool {
        true
    }
}
