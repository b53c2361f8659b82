//! Request and response bodies of the administrative API

use metalboot_common::{Installation, InstallState, System};
use serde::{Deserialize, Serialize};

fn default_pattern() -> String {
    ".*".to_string()
}

fn default_true() -> bool {
    true
}

/// Enlist request
#[derive(Debug, Clone, Deserialize)]
pub struct EnlistRequest {
    /// Regular expression matched against appliance-native names
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

/// Enlist response
#[derive(Debug, Clone, Serialize)]
pub struct EnlistResponse {
    pub appliance_id: i64,
    pub systems: Vec<System>,
    pub total: usize,
}

/// Deploy an image to a system
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// System id or (partial) name
    pub system: String,
    pub image_id: i64,
    /// Validity in seconds, server default when absent
    #[serde(default)]
    pub valid_for_secs: Option<u64>,
    #[serde(default)]
    pub snippet_text: String,
    #[serde(default)]
    pub kickstart_override: String,
    #[serde(default)]
    pub comment: String,
    /// Power cycle the system into network boot right away
    #[serde(default = "default_true")]
    pub boot_network: bool,
}

/// Deploy response
#[derive(Debug, Clone, Serialize)]
pub struct DeployResponse {
    pub installation: Installation,
    pub boot_scheduled: bool,
}

/// Installation listing filter
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationsQuery {
    #[serde(default)]
    pub threshold: Option<InstallState>,
}
