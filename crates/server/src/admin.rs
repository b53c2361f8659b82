//! Administrative API: systems, appliances, images and installations

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use metalboot_common::{
    Appliance, Error, Image, InstallState, Installation, NewAppliance, NewImage,
    NewInstallation, NewSystem, System,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::handlers::{ApiError, AppState};
use crate::models::{
    DeployRequest, DeployResponse, EnlistRequest, EnlistResponse, InstallationsQuery,
};
use crate::power::{load_target, PowerAction};

/// Register or merge a system by hardware address
pub async fn register_system_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewSystem>,
) -> Result<(StatusCode, Json<System>), ApiError> {
    if payload.hw_addrs.is_empty() {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "at least one hardware address is required".to_string(),
        });
    }

    let system = state.store.register_system(payload).await?;
    // cached resolutions may point at the discovery system for these addresses
    state.resolver.cache().clear();
    info!(system_id = system.id, name = %system.name, "system registered");

    Ok((StatusCode::CREATED, Json(system)))
}

pub async fn list_systems_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let systems = state.store.list_systems().await?;

    Ok(Json(serde_json::json!({
        "systems": systems,
        "total": systems.len()
    })))
}

/// Fuzzy lookup by id or name
pub async fn get_system_handler(
    State(state): State<Arc<AppState>>,
    Path(pattern): Path<String>,
) -> Result<Json<System>, ApiError> {
    Ok(Json(state.store.find_system(&pattern).await?))
}

/// Power cycle a system into network boot, synchronously
pub async fn reset_system_handler(
    State(state): State<Arc<AppState>>,
    Path(pattern): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let system = state.store.find_system(&pattern).await?;
    let target = load_target(state.store.as_ref(), system.id).await?;

    info!(system_id = system.id, "resetting system into network boot");
    state.drivers.boot_network(&target).await?;

    Ok(Json(serde_json::json!({
        "system_id": system.id,
        "status": "reset"
    })))
}

pub async fn create_appliance_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewAppliance>,
) -> Result<(StatusCode, Json<Appliance>), ApiError> {
    let appliance = state.store.create_appliance(payload).await?;
    info!(appliance_id = appliance.id, kind = %appliance.kind, "appliance created");

    Ok((StatusCode::CREATED, Json(appliance)))
}

pub async fn get_appliance_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Appliance>, ApiError> {
    let appliance = state
        .store
        .find_appliance_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("appliance {}", id)))?;

    Ok(Json(appliance))
}

/// Scan an appliance and register every matching machine against it
pub async fn enlist_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<EnlistRequest>,
) -> Result<Json<EnlistResponse>, ApiError> {
    let appliance = state
        .store
        .find_appliance_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("appliance {}", id)))?;

    let found = state.drivers.enlist(&appliance, &payload.pattern).await?;
    info!(
        appliance_id = id,
        pattern = %payload.pattern,
        found = found.len(),
        "enlisting systems"
    );

    let mut systems = Vec::with_capacity(found.len());
    for result in found {
        if result.hw_addrs.is_empty() {
            warn!(uid = %result.uid, "skipping machine without hardware addresses");
            continue;
        }
        let system = state
            .store
            .register_system(NewSystem {
                name: None,
                hw_addrs: result.hw_addrs,
                facts: result.facts,
                uid: Some(result.uid),
                appliance_id: Some(appliance.id),
            })
            .await?;
        systems.push(system);
    }
    state.resolver.cache().clear();

    Ok(Json(EnlistResponse {
        appliance_id: appliance.id,
        total: systems.len(),
        systems,
    }))
}

pub async fn create_image_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewImage>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let image = state.store.create_image(payload).await?;
    info!(image_id = image.id, name = %image.name, "image created");

    Ok((StatusCode::CREATED, Json(image)))
}

/// Queue an installation of an image on a system
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeployResponse>), ApiError> {
    let system = state.store.find_system(&payload.system).await?;
    state
        .store
        .find_image_by_id(payload.image_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("image {}", payload.image_id)))?;

    let valid_for = match payload.valid_for_secs {
        Some(secs) => i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds),
        None => chrono::Duration::from_std(state.config.install_duration).ok(),
    };
    let valid_until = valid_for
        .and_then(|valid_for| Utc::now().checked_add_signed(valid_for))
        .ok_or_else(|| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "validity out of range".to_string(),
        })?;

    let installation = state
        .store
        .create_installation(NewInstallation {
            uuid: Uuid::new_v4(),
            system_id: system.id,
            image_id: payload.image_id,
            valid_until,
            snippet_text: payload.snippet_text,
            kickstart_override: payload.kickstart_override,
            comment: payload.comment,
        })
        .await?;
    // drop cached discovery answers for this system's addresses
    state.resolver.cache().clear();

    info!(
        system_id = system.id,
        image_id = installation.image_id,
        install_uuid = %installation.uuid,
        "installation queued"
    );

    let boot_scheduled = payload.boot_network && system.appliance_id.is_some();
    if boot_scheduled {
        state
            .power
            .schedule(PowerAction::BootNetwork, system.id, std::time::Duration::ZERO)?;
    }

    Ok((
        StatusCode::CREATED,
        Json(DeployResponse {
            installation,
            boot_scheduled,
        }),
    ))
}

/// Live installations at or below a state, across all systems
pub async fn list_installations_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InstallationsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let threshold = query.threshold.unwrap_or(InstallState::Finished);
    let installations: Vec<Installation> = state
        .store
        .find_any_installation_by_state_threshold(threshold, Utc::now())
        .await?;

    Ok(Json(serde_json::json!({
        "threshold": threshold,
        "installations": installations,
        "total": installations.len()
    })))
}
