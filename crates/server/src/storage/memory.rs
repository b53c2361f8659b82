//! In-memory storage, used when no Redis URL is configured and in tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metalboot_common::{
    Appliance, Error, HwAddr, Image, InstallState, Installation, NewAppliance, NewImage,
    NewInstallation, NewSystem, Result, System,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{merge_system, new_installation, new_system, select_installations, Store};

#[derive(Default)]
struct Tables {
    next_id: i64,
    systems: BTreeMap<i64, System>,
    appliances: BTreeMap<i64, Appliance>,
    images: BTreeMap<i64, Image>,
    installations: HashMap<Uuid, Installation>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mutex-guarded tables; every read query is counted
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    queries: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read queries served so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<MutexGuard<'_, Tables>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.write()
    }

    fn write(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        self.write().map(|_| ())
    }

    async fn find_system_by_mac(&self, mac: &HwAddr) -> Result<Option<System>> {
        let tables = self.read()?;
        Ok(tables
            .systems
            .values()
            .find(|s| s.hw_addrs.contains(mac))
            .cloned())
    }

    async fn find_system_by_id(&self, id: i64) -> Result<Option<System>> {
        Ok(self.read()?.systems.get(&id).cloned())
    }

    async fn list_systems(&self) -> Result<Vec<System>> {
        Ok(self.read()?.systems.values().cloned().collect())
    }

    async fn register_system(&self, new: NewSystem) -> Result<System> {
        let mut tables = self.write()?;

        let existing = tables
            .systems
            .values()
            .find(|s| new.hw_addrs.iter().any(|mac| s.hw_addrs.contains(mac)))
            .map(|s| s.id);

        let system = match existing {
            Some(id) => {
                let system = tables
                    .systems
                    .get_mut(&id)
                    .ok_or_else(|| Error::Storage(format!("system {} vanished", id)))?;
                merge_system(system, new);
                debug!(system_id = id, "updated existing system");
                system.clone()
            }
            None => {
                let id = tables.next_id();
                let system = new_system(id, new);
                tables.systems.insert(id, system.clone());
                debug!(system_id = id, "registered new system");
                system
            }
        };
        Ok(system)
    }

    async fn create_appliance(&self, new: NewAppliance) -> Result<Appliance> {
        let mut tables = self.write()?;
        if tables.appliances.values().any(|a| a.name == new.name) {
            return Err(Error::AlreadyExists(format!(
                "appliance '{}'",
                new.name
            )));
        }
        let appliance = Appliance {
            id: tables.next_id(),
            name: new.name,
            kind: new.kind,
            uri: new.uri,
        };
        tables.appliances.insert(appliance.id, appliance.clone());
        Ok(appliance)
    }

    async fn find_appliance_by_id(&self, id: i64) -> Result<Option<Appliance>> {
        Ok(self.read()?.appliances.get(&id).cloned())
    }

    async fn find_appliance_by_name(&self, name: &str) -> Result<Option<Appliance>> {
        Ok(self
            .read()?
            .appliances
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn create_image(&self, new: NewImage) -> Result<Image> {
        let mut tables = self.write()?;
        let image = Image {
            id: tables.next_id(),
            name: new.name,
            kind: new.kind,
            iso_sha256: new.iso_sha256,
            liveimg_sha256: new.liveimg_sha256,
        };
        tables.images.insert(image.id, image.clone());
        Ok(image)
    }

    async fn find_image_by_id(&self, id: i64) -> Result<Option<Image>> {
        Ok(self.read()?.images.get(&id).cloned())
    }

    async fn create_installation(&self, new: NewInstallation) -> Result<Installation> {
        let mut tables = self.write()?;
        if !tables.systems.contains_key(&new.system_id) {
            return Err(Error::NotFound(format!("system {}", new.system_id)));
        }
        if !tables.images.contains_key(&new.image_id) {
            return Err(Error::NotFound(format!("image {}", new.image_id)));
        }
        let installation = new_installation(tables.next_id(), new, Utc::now());
        tables
            .installations
            .insert(installation.uuid, installation.clone());
        Ok(installation)
    }

    async fn find_installations_by_state_threshold(
        &self,
        system_id: i64,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>> {
        let tables = self.read()?;
        let rows = tables
            .installations
            .values()
            .filter(|i| i.system_id == system_id)
            .cloned();
        Ok(select_installations(rows, threshold, now))
    }

    async fn find_any_installation_by_state_threshold(
        &self,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>> {
        let tables = self.read()?;
        Ok(select_installations(
            tables.installations.values().cloned(),
            threshold,
            now,
        ))
    }

    async fn find_installation_by_uuid(
        &self,
        uuid: Uuid,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Option<Installation>> {
        Ok(self
            .read()?
            .installations
            .get(&uuid)
            .filter(|i| i.qualifies(threshold, now))
            .cloned())
    }

    async fn update_installation_state(
        &self,
        uuid: Uuid,
        max_current: InstallState,
        state: InstallState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.write()?;
        match tables.installations.get_mut(&uuid) {
            Some(installation) if installation.qualifies(max_current, now) => {
                installation.state = state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
