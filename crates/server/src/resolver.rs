//! MAC resolver
//!
//! Maps a boot request's hardware address to the system and its current
//! installation. Unknown addresses, and known systems without a qualifying
//! installation, fall back to the discovery system registered under the
//! all-zero address.

use chrono::Utc;
use metalboot_common::{Error, HwAddr, InstallState, Installation, Result, System};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::ResolutionCache;
use crate::storage::Store;

/// Outcome of resolving an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub installation: Installation,
    pub system: System,
    /// Answered by the discovery system rather than the requesting machine
    pub discovery: bool,
}

pub struct Resolver {
    store: Arc<dyn Store>,
    cache: ResolutionCache,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>, cache: ResolutionCache) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolve `mac` (absent means discovery) to the most recent live
    /// installation at or below `threshold`.
    pub async fn resolve(&self, mac: Option<&HwAddr>, threshold: InstallState) -> Result<Resolution> {
        let null = HwAddr::null();
        let requested = mac.unwrap_or(&null);
        let now = Utc::now();

        if let Some(hit) = self.cache.get(requested, threshold) {
            if !hit.installation.is_expired(now) {
                return Ok(hit);
            }
        }

        let resolution = match self.resolve_direct(requested, threshold).await? {
            Some(resolution) => resolution,
            None => self
                .resolve_discovery(threshold)
                .await?
                .ok_or_else(|| Error::NotFound(format!("unknown system {}", requested)))?,
        };

        self.cache.insert(requested, threshold, resolution.clone());
        Ok(resolution)
    }

    async fn first_installation(&self, system: System, threshold: InstallState) -> Result<Option<(Installation, System)>> {
        let installations = self
            .store
            .find_installations_by_state_threshold(system.id, threshold, Utc::now())
            .await?;
        Ok(installations.into_iter().next().map(|i| (i, system)))
    }

    async fn resolve_direct(&self, mac: &HwAddr, threshold: InstallState) -> Result<Option<Resolution>> {
        if mac.is_null() {
            return Ok(None);
        }

        let Some(system) = self.store.find_system_by_mac(mac).await? else {
            info!(mac = %mac, "unknown system, booting discovery");
            return Ok(None);
        };

        let system_id = system.id;
        match self.first_installation(system, threshold).await? {
            Some((installation, system)) => {
                debug!(
                    mac = %mac,
                    system_id,
                    install_uuid = %installation.uuid,
                    image_id = installation.image_id,
                    "known system, booting installer"
                );
                Ok(Some(Resolution {
                    installation,
                    system,
                    discovery: false,
                }))
            }
            None => {
                info!(mac = %mac, system_id, "known system but not installable, booting discovery");
                Ok(None)
            }
        }
    }

    async fn resolve_discovery(&self, threshold: InstallState) -> Result<Option<Resolution>> {
        let Some(system) = self.store.find_system_by_mac(&HwAddr::null()).await? else {
            tracing::warn!("host with 00:00:00:00:00:00 address not found, discovery will fail");
            return Ok(None);
        };

        Ok(self
            .first_installation(system, threshold)
            .await?
            .map(|(installation, system)| Resolution {
                installation,
                system,
                discovery: true,
            }))
    }
}
