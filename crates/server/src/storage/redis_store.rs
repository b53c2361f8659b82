//! Redis storage
//!
//! Entities are stored as JSON strings, installations as hashes so that the
//! conditional state update can run server-side as a Lua script.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metalboot_common::{
    Appliance, Error, HwAddr, Image, InstallState, Installation, NewAppliance, NewImage,
    NewInstallation, NewSystem, Result, System,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{merge_system, new_installation, new_system, select_installations, Store};

const SEQUENCE_KEY: &str = "metalboot:sequence";
const SYSTEMS_KEY: &str = "metalboot:systems";
const INSTALLATIONS_KEY: &str = "metalboot:installations";

/// KEYS[1] installation hash; ARGV max current state, new state, now (ms)
const UPDATE_STATE_SCRIPT: &str = r#"
local state = tonumber(redis.call('HGET', KEYS[1], 'state'))
if not state then
    return 0
end
local valid_until = tonumber(redis.call('HGET', KEYS[1], 'valid_until'))
if state > tonumber(ARGV[1]) or valid_until <= tonumber(ARGV[3]) then
    return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2])
return 1
"#;

fn storage_err(err: RedisError) -> Error {
    Error::Storage(err.to_string())
}

fn system_key(id: i64) -> String {
    format!("metalboot:system:{}", id)
}

fn mac_key(mac: &HwAddr) -> String {
    format!("metalboot:mac:{}", mac)
}

fn appliance_key(id: i64) -> String {
    format!("metalboot:appliance:{}", id)
}

fn appliance_name_key(name: &str) -> String {
    format!("metalboot:appliance:name:{}", name)
}

fn image_key(id: i64) -> String {
    format!("metalboot:image:{}", id)
}

fn installation_key(uuid: impl std::fmt::Display) -> String {
    format!("metalboot:installation:{}", uuid)
}

fn system_installations_key(system_id: i64) -> String {
    format!("metalboot:system:{}:installations", system_id)
}

/// Redis-backed store
pub struct RedisStore {
    conn: ConnectionManager,
    update_state: Script,
}

impl RedisStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(storage_err)?;
        let conn = ConnectionManager::new(client).await.map_err(storage_err)?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            update_state: Script::new(UPDATE_STATE_SCRIPT),
        })
    }

    async fn next_id(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(SEQUENCE_KEY, 1).await.map_err(storage_err)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(key).await.map_err(storage_err)?;
        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, json).await.map_err(storage_err)?;
        Ok(())
    }

    async fn store_system(&self, system: &System) -> Result<()> {
        self.set_json(&system_key(system.id), system).await?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .sadd(SYSTEMS_KEY, system.id)
            .await
            .map_err(storage_err)?;
        for mac in &system.hw_addrs {
            let _: () = conn
                .set(mac_key(mac), system.id)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn load_installation(&self, uuid: &str) -> Result<Option<Installation>> {
        let key = installation_key(uuid);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(storage_err)?;

        let Some(data) = fields.get("data") else {
            return Ok(None);
        };
        let mut installation: Installation = serde_json::from_str(data)?;
        if let Some(state) = fields.get("state") {
            let raw: i16 = state
                .parse()
                .map_err(|_| Error::Storage(format!("bad state '{}' in {}", state, key)))?;
            installation.state = InstallState::try_from(raw)?;
        }
        Ok(Some(installation))
    }

    async fn load_installations(&self, index_key: &str) -> Result<Vec<Installation>> {
        let mut conn = self.conn.clone();
        let uuids: Vec<String> = conn.smembers(index_key).await.map_err(storage_err)?;

        let mut rows = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            if let Some(installation) = self.load_installation(&uuid).await? {
                rows.push(installation);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn find_system_by_mac(&self, mac: &HwAddr) -> Result<Option<System>> {
        let mut conn = self.conn.clone();
        let id: Option<i64> = conn.get(mac_key(mac)).await.map_err(storage_err)?;
        match id {
            Some(id) => self.find_system_by_id(id).await,
            None => Ok(None),
        }
    }

    async fn find_system_by_id(&self, id: i64) -> Result<Option<System>> {
        self.get_json(&system_key(id)).await
    }

    async fn list_systems(&self) -> Result<Vec<System>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<i64> = conn.smembers(SYSTEMS_KEY).await.map_err(storage_err)?;
        ids.sort_unstable();

        let mut systems = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(system) = self.find_system_by_id(id).await? {
                systems.push(system);
            }
        }
        Ok(systems)
    }

    async fn register_system(&self, new: NewSystem) -> Result<System> {
        let mut existing = None;
        for mac in &new.hw_addrs {
            if let Some(system) = self.find_system_by_mac(mac).await? {
                existing = Some(system);
                break;
            }
        }

        let system = match existing {
            Some(mut system) => {
                merge_system(&mut system, new);
                debug!(system_id = system.id, "updated existing system");
                system
            }
            None => {
                let system = new_system(self.next_id().await?, new);
                debug!(system_id = system.id, "registered new system");
                system
            }
        };

        self.store_system(&system).await?;
        Ok(system)
    }

    async fn create_appliance(&self, new: NewAppliance) -> Result<Appliance> {
        let appliance = Appliance {
            id: self.next_id().await?,
            name: new.name,
            kind: new.kind,
            uri: new.uri,
        };

        let mut conn = self.conn.clone();
        let claimed: bool = conn
            .set_nx(appliance_name_key(&appliance.name), appliance.id)
            .await
            .map_err(storage_err)?;
        if !claimed {
            return Err(Error::AlreadyExists(format!(
                "appliance '{}'",
                appliance.name
            )));
        }

        self.set_json(&appliance_key(appliance.id), &appliance).await?;
        Ok(appliance)
    }

    async fn find_appliance_by_id(&self, id: i64) -> Result<Option<Appliance>> {
        self.get_json(&appliance_key(id)).await
    }

    async fn find_appliance_by_name(&self, name: &str) -> Result<Option<Appliance>> {
        let mut conn = self.conn.clone();
        let id: Option<i64> = conn
            .get(appliance_name_key(name))
            .await
            .map_err(storage_err)?;
        match id {
            Some(id) => self.find_appliance_by_id(id).await,
            None => Ok(None),
        }
    }

    async fn create_image(&self, new: NewImage) -> Result<Image> {
        let image = Image {
            id: self.next_id().await?,
            name: new.name,
            kind: new.kind,
            iso_sha256: new.iso_sha256,
            liveimg_sha256: new.liveimg_sha256,
        };
        self.set_json(&image_key(image.id), &image).await?;
        Ok(image)
    }

    async fn find_image_by_id(&self, id: i64) -> Result<Option<Image>> {
        self.get_json(&image_key(id)).await
    }

    async fn create_installation(&self, new: NewInstallation) -> Result<Installation> {
        if self.find_system_by_id(new.system_id).await?.is_none() {
            return Err(Error::NotFound(format!("system {}", new.system_id)));
        }
        if self.find_image_by_id(new.image_id).await?.is_none() {
            return Err(Error::NotFound(format!("image {}", new.image_id)));
        }

        let installation = new_installation(self.next_id().await?, new, Utc::now());
        let key = installation_key(installation.uuid);
        let data = serde_json::to_string(&installation)?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("data", data),
                    ("state", installation.state.as_i16().to_string()),
                    (
                        "valid_until",
                        installation.valid_until.timestamp_millis().to_string(),
                    ),
                ],
            )
            .await
            .map_err(storage_err)?;

        let uuid = installation.uuid.to_string();
        let _: () = conn
            .sadd(system_installations_key(installation.system_id), &uuid)
            .await
            .map_err(storage_err)?;
        let _: () = conn
            .sadd(INSTALLATIONS_KEY, &uuid)
            .await
            .map_err(storage_err)?;

        info!(install_uuid = %installation.uuid, system_id = installation.system_id, "queued installation");
        Ok(installation)
    }

    async fn find_installations_by_state_threshold(
        &self,
        system_id: i64,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>> {
        let rows = self
            .load_installations(&system_installations_key(system_id))
            .await?;
        Ok(select_installations(rows, threshold, now))
    }

    async fn find_any_installation_by_state_threshold(
        &self,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Installation>> {
        let rows = self.load_installations(INSTALLATIONS_KEY).await?;
        Ok(select_installations(rows, threshold, now))
    }

    async fn find_installation_by_uuid(
        &self,
        uuid: Uuid,
        threshold: InstallState,
        now: DateTime<Utc>,
    ) -> Result<Option<Installation>> {
        Ok(self
            .load_installation(&uuid.to_string())
            .await?
            .filter(|i| i.qualifies(threshold, now)))
    }

    async fn update_installation_state(
        &self,
        uuid: Uuid,
        max_current: InstallState,
        state: InstallState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i32 = self
            .update_state
            .key(installation_key(uuid))
            .arg(max_current.as_i16())
            .arg(state.as_i16())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(updated == 1)
    }
}
