//! Data models shared by the drivers and the server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::state::InstallState;

/// A single descriptive hardware fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
}

impl Fact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of facts; duplicate keys are allowed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Facts(pub Vec<Fact>);

impl Facts {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Fact::new(key, value));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.0.iter()
    }

    /// First value recorded for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    /// Key to value view. When a key repeats, the earliest entry wins.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::with_capacity(self.0.len());
        for fact in &self.0 {
            map.entry(fact.key.clone())
                .or_insert_with(|| fact.value.clone());
        }
        map
    }

    /// Put `newer` in front of the existing facts.
    pub fn prepend(&mut self, newer: Facts) {
        let mut merged = newer.0;
        merged.append(&mut self.0);
        self.0 = merged;
    }
}

impl FromIterator<Fact> for Facts {
    fn from_iter<T: IntoIterator<Item = Fact>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A physical or virtual machine known to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    pub id: i64,
    pub name: String,

    /// Appliance able to power-control this system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appliance_id: Option<i64>,

    /// Appliance-native identity (domain UUID, Redfish system id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Canonically ordered, no duplicates
    pub hw_addrs: Vec<HwAddr>,

    pub facts: Facts,
}

impl System {
    /// Address treated as the system's primary one
    pub fn primary_hw_addr(&self) -> Option<&HwAddr> {
        self.hw_addrs.first()
    }

    pub fn is_discovery(&self) -> bool {
        self.hw_addrs.iter().any(HwAddr::is_null)
    }
}

/// Registration payload; matched against existing systems by address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSystem {
    #[serde(default)]
    pub name: Option<String>,
    pub hw_addrs: Vec<HwAddr>,
    #[serde(default)]
    pub facts: Facts,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub appliance_id: Option<i64>,
}

/// Kind of power/inventory management endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceKind {
    Noop,
    Libvirt,
    Redfish,
    RedfishManual,
}

impl ApplianceKind {
    pub fn as_i16(self) -> i16 {
        match self {
            ApplianceKind::Noop => 1,
            ApplianceKind::Libvirt => 2,
            ApplianceKind::Redfish => 3,
            ApplianceKind::RedfishManual => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplianceKind::Noop => "noop",
            ApplianceKind::Libvirt => "libvirt",
            ApplianceKind::Redfish => "redfish",
            ApplianceKind::RedfishManual => "redfish_manual",
        }
    }
}

impl TryFrom<i16> for ApplianceKind {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(ApplianceKind::Noop),
            2 => Ok(ApplianceKind::Libvirt),
            3 => Ok(ApplianceKind::Redfish),
            4 => Ok(ApplianceKind::RedfishManual),
            other => Err(Error::Storage(format!("unknown appliance kind {}", other))),
        }
    }
}

impl FromStr for ApplianceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "noop" => Ok(ApplianceKind::Noop),
            "libvirt" => Ok(ApplianceKind::Libvirt),
            "redfish" => Ok(ApplianceKind::Redfish),
            "redfish_manual" | "redfishmanual" => Ok(ApplianceKind::RedfishManual),
            _ => Err(Error::NotFound(format!("appliance kind {}", s))),
        }
    }
}

impl fmt::Display for ApplianceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hypervisor or BMC endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appliance {
    pub id: i64,
    pub name: String,
    pub kind: ApplianceKind,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppliance {
    pub name: String,
    pub kind: ApplianceKind,
    pub uri: String,
}

/// Image payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Iso,
    Container,
    Rpm,
}

/// Installable payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub kind: ImageKind,

    /// Filled in once the payload has been extracted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_sha256: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveimg_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewImage {
    pub name: String,
    pub kind: ImageKind,
    #[serde(default)]
    pub iso_sha256: Option<String>,
    #[serde(default)]
    pub liveimg_sha256: Option<String>,
}

/// One timed attempt to provision a system with an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,

    /// External identity handed to the booting machine
    pub uuid: Uuid,

    pub state: InstallState,

    /// Past this instant the installation is treated as nonexistent
    pub valid_until: DateTime<Utc>,

    pub queued_at: DateTime<Utc>,

    pub system_id: i64,
    pub image_id: i64,

    #[serde(default)]
    pub snippet_text: String,
    #[serde(default)]
    pub kickstart_override: String,
    #[serde(default)]
    pub comment: String,
}

impl Installation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }

    /// Live and at or below `threshold`
    pub fn qualifies(&self, threshold: InstallState, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.state.within(threshold)
    }
}

/// Deploy request as accepted by the persistence layer
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub uuid: Uuid,
    pub system_id: i64,
    pub image_id: i64,
    pub valid_until: DateTime<Utc>,
    pub snippet_text: String,
    pub kickstart_override: String,
    pub comment: String,
}
