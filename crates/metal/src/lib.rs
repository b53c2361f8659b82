//! Appliance metal drivers
//!
//! Each appliance kind implements the same capability set: enlist the
//! machines an appliance manages, and force the next boot of one of them
//! from network or local disk followed by a power cycle.

pub mod libvirt;
pub mod noop;
pub mod redfish;

use async_trait::async_trait;
use metalboot_common::{Appliance, ApplianceKind, Error, Facts, HwAddr, Result, System};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use libvirt::{LibvirtMetal, VirshConnector};
pub use noop::NoopMetal;
pub use redfish::{RedfishBootTarget, RedfishMetal};

/// A machine found on an appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnlistResult {
    pub hw_addrs: Vec<HwAddr>,
    pub facts: Facts,
    pub uid: String,
}

/// A system together with the appliance that controls it
#[derive(Debug, Clone)]
pub struct SystemAppliance {
    pub system: System,
    pub appliance: Option<Appliance>,
}

impl SystemAppliance {
    pub fn new(system: System, appliance: Option<Appliance>) -> Self {
        Self { system, appliance }
    }

    /// Appliance and UID, or the reason power control is impossible.
    pub fn controlled(&self) -> Result<(&Appliance, &str)> {
        let appliance = match (&self.system.appliance_id, &self.appliance) {
            (Some(_), Some(appliance)) => appliance,
            _ => return Err(Error::SystemWithoutAppliance),
        };
        let uid = self
            .system
            .uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .ok_or(Error::SystemWithoutUid)?;
        Ok((appliance, uid))
    }
}

/// Capability set implemented by every appliance kind
#[async_trait]
pub trait Metal: Send + Sync {
    /// List machines whose native name matches `pattern`. Read-only.
    async fn enlist(&self, appliance: &Appliance, pattern: &Regex) -> Result<Vec<EnlistResult>>;

    /// Next boot from network, then power cycle.
    async fn boot_network(&self, target: &SystemAppliance) -> Result<()>;

    /// Next boot from local disk, then power cycle.
    async fn boot_local(&self, target: &SystemAppliance) -> Result<()>;

    /// Whether the driver turns the machine back on after completion. The
    /// installer then powers off instead of rebooting on its own.
    fn controls_power(&self) -> bool {
        false
    }
}

/// Settings the drivers need from the server configuration
#[derive(Debug, Clone)]
pub struct MetalConfig {
    /// URL machines use to reach the boot server
    pub base_url: String,
    pub redfish_boot_target: RedfishBootTarget,
}

/// One driver instance per appliance kind
#[derive(Clone)]
pub struct Drivers {
    noop: Arc<dyn Metal>,
    libvirt: Arc<dyn Metal>,
    redfish: Arc<dyn Metal>,
    redfish_manual: Arc<dyn Metal>,
}

impl Drivers {
    pub fn new(config: &MetalConfig) -> Self {
        Self {
            noop: Arc::new(NoopMetal),
            libvirt: Arc::new(LibvirtMetal::new(Arc::new(VirshConnector::default()))),
            redfish: Arc::new(RedfishMetal::new(config.clone(), false)),
            redfish_manual: Arc::new(RedfishMetal::new(config.clone(), true)),
        }
    }

    /// Swap a single kind's driver, used to plug in fakes.
    pub fn with_driver(mut self, kind: ApplianceKind, driver: Arc<dyn Metal>) -> Self {
        match kind {
            ApplianceKind::Noop => self.noop = driver,
            ApplianceKind::Libvirt => self.libvirt = driver,
            ApplianceKind::Redfish => self.redfish = driver,
            ApplianceKind::RedfishManual => self.redfish_manual = driver,
        }
        self
    }

    /// The only place appliance kinds are mapped to behavior.
    pub fn for_kind(&self, kind: ApplianceKind) -> &dyn Metal {
        match kind {
            ApplianceKind::Noop => self.noop.as_ref(),
            ApplianceKind::Libvirt => self.libvirt.as_ref(),
            ApplianceKind::Redfish => self.redfish.as_ref(),
            ApplianceKind::RedfishManual => self.redfish_manual.as_ref(),
        }
    }

    pub async fn enlist(&self, appliance: &Appliance, pattern: &str) -> Result<Vec<EnlistResult>> {
        let regex = compile_pattern(pattern)?;
        self.for_kind(appliance.kind).enlist(appliance, &regex).await
    }

    pub async fn boot_network(&self, target: &SystemAppliance) -> Result<()> {
        let (appliance, _) = target.controlled()?;
        self.for_kind(appliance.kind).boot_network(target).await
    }

    pub async fn boot_local(&self, target: &SystemAppliance) -> Result<()> {
        let (appliance, _) = target.controlled()?;
        self.for_kind(appliance.kind).boot_local(target).await
    }

    /// True when the system's appliance brings it back after completion.
    pub fn controls_power(&self, appliance: Option<&Appliance>) -> bool {
        appliance
            .map(|a| self.for_kind(a.kind).controls_power())
            .unwrap_or(false)
    }
}

pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Parse appliance-reported addresses, skipping anything unparsable.
pub(crate) fn parse_hw_addrs<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<HwAddr> {
    let addrs = raw
        .into_iter()
        .filter_map(|s| match s.parse::<HwAddr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                tracing::warn!(address = s, "ignoring unparsable hardware address");
                None
            }
        })
        .collect();
    metalboot_common::canonicalize(addrs)
}
