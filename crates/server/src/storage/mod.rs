//! Persistence for systems, appliances, images and installations

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metalboot_common::{
    canonicalize, Appliance, Error, HwAddr, Image, InstallState, Installation, NewAppliance,
    NewImage, NewInstallation, NewSystem, Result, System,
};
use uuid::Uuid;

/// Storage backend
///
/// Installation queries never return expired rows and order their results
/// most-recent-first: `valid_until` descending, then id descending.
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn find_system_by_mac(&self, mac: &HwAddr) -> Result<Option<System>>;

    async fn find_system_by_id(&self, id: i64) -> Result<Option<System>>;

    async fn list_systems(&self) -> Result<Vec<System>>;

    /// Create a system, or merge into the one already owning any of the
    /// supplied addresses.
    async fn register_system(&self, new: NewSystem) -> Result<System>;

    async fn create_appliance(&self, new: NewAppliance) -> Result<Appliance>;

    async fn find_appliance_by_id(&self, id: i64) -> Result<Option<Appliance>>;

    async fn find_appliance_by_name(&self, name: &str) -> Result<Option<Appliance>>;

    async fn create_image(&self, new: NewImage) -> Result<Image>;

    async fn find_image_by_id(&self, id: i64) -> Result<Option<Image>>;

    async fn create_installation(&self, new: NewInstallation) -> Result<Installation>;

    async fn find_installations_by_state_threshold(
        &self,
        system_id: i64,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>>;

    async fn find_any_installation_by_state_threshold(
        &self,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>>;

    async fn find_installation_by_uuid(
        &self,
        uuid: Uuid,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Option<Installation>>;

    /// Set `state` only if the installation is live and currently at or
    /// below `max_current`. Returns whether the row was updated.
    async fn update_installation_state(
        &self,
        uuid: Uuid,
        max_current: InstallState,
        state: InstallState,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Fuzzy lookup: numeric id, exact name, then a unique
    /// case-insensitive substring of the name.
    async fn find_system(&self, pattern: &str) -> Result<System> {
        if let Ok(id) = pattern.parse::<i64>() {
            if let Some(system) = self.find_system_by_id(id).await? {
                return Ok(system);
            }
        }

        let systems = self.list_systems().await?;
        if let Some(system) = systems.iter().find(|s| s.name == pattern) {
            return Ok(system.clone());
        }

        let needle = pattern.to_lowercase();
        let mut matches = systems
            .into_iter()
            .filter(|s| s.name.to_lowercase().contains(&needle));
        match (matches.next(), matches.next()) {
            (Some(system), None) => Ok(system),
            (Some(_), Some(_)) => Err(Error::NotFound(format!(
                "system pattern '{}' is ambiguous",
                pattern
            ))),
            _ => Err(Error::NotFound(format!("system '{}'", pattern))),
        }
    }
}

/// Merge a registration into an existing system.
pub(crate) fn merge_system(existing: &mut System, new: NewSystem) {
    let mut addrs = std::mem::take(&mut existing.hw_addrs);
    addrs.extend(new.hw_addrs);
    existing.hw_addrs = canonicalize(addrs);
    existing.facts.prepend(new.facts);

    if let Some(name) = new.name.filter(|n| !n.is_empty()) {
        existing.name = name;
    }
    if new.uid.is_some() {
        existing.uid = new.uid;
    }
    if new.appliance_id.is_some() {
        existing.appliance_id = new.appliance_id;
    }
}

/// Build a freshly registered system.
pub(crate) fn new_system(id: i64, new: NewSystem) -> System {
    System {
        id,
        name: new
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("system-{}", id)),
        appliance_id: new.appliance_id,
        uid: new.uid,
        hw_addrs: canonicalize(new.hw_addrs),
        facts: new.facts,
    }
}

pub(crate) fn new_installation(id: i64, new: NewInstallation, now: DateTime<Utc>) -> Installation {
    Installation {
        id,
        uuid: new.uuid,
        state: InstallState::Queued,
        valid_until: new.valid_until,
        queued_at: now,
        system_id: new.system_id,
        image_id: new.image_id,
        snippet_text: new.snippet_text,
        kickstart_override: new.kickstart_override,
        comment: new.comment,
    }
}

/// Keep live rows at or below `threshold`, most recent first.
pub(crate) fn select_installations(
    rows: impl IntoIterator<Item = Installation>,
    threshold: InstallState,
    now: DateTime<Utc>,
) -> Vec<Installation> {
    let mut selected: Vec<Installation> = rows
        .into_iter()
        .filter(|i| i.qualifies(threshold, now))
        .collect();
    selected.sort_by(|a, b| {
        b.valid_until
            .cmp(&a.valid_until)
            .then_with(|| b.id.cmp(&a.id))
    });
    selected
}
