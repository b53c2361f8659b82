//! HTTP handlers for the boot surface

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metalboot_common::Error;
use metalboot_metal::Drivers;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info};

use crate::{
    boot::{BootResponse, BootService},
    cache::{CacheStats, ResolutionCache},
    completion::CompletionHandler,
    config::Config,
    hostname::system_hostname,
    lifecycle::Lifecycle,
    logstore,
    power::{self, PowerQueue},
    resolver::Resolver,
    storage::Store,
    templates::{CommonParams, Renderer},
};

/// Shared application state
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub resolver: Arc<Resolver>,
    pub boot: Arc<BootService>,
    pub completion: CompletionHandler,
    pub drivers: Drivers,
    pub power: PowerQueue,
}

impl AppState {
    /// Wire the services together and start the power worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, store: Arc<dyn Store>, drivers: Drivers) -> Self {
        let config = Arc::new(config);
        let cache = ResolutionCache::new(config.cache_capacity, config.cache_ttl);
        let resolver = Arc::new(Resolver::new(store.clone(), cache));
        let lifecycle = Arc::new(Lifecycle::new(resolver.clone()));
        let renderer = Renderer::new(CommonParams::from_config(&config));

        let boot = Arc::new(BootService::new(
            config.clone(),
            resolver.clone(),
            lifecycle.clone(),
            renderer,
            drivers.clone(),
        ));

        let (queue, worker) = power::channel(store.clone(), drivers.clone());
        worker.spawn();

        let completion =
            CompletionHandler::new(lifecycle, store.clone(), queue.clone(), config.power_delay);

        AppState {
            config,
            store,
            resolver,
            boot,
            completion,
            drivers,
            power: queue,
        }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) | Error::Expired(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::StateConflict { .. } => StatusCode::CONFLICT,
            Error::ApplianceUnreachable(_) | Error::ApplianceProtocol(_) => StatusCode::BAD_GATEWAY,
            Error::Configuration(_)
            | Error::SystemWithoutAppliance
            | Error::SystemWithoutUid
            | Error::UnsupportedUriScheme(_)
            | Error::InvalidHwAddr(_)
            | Error::InvalidPattern { .. }
            | Error::MalformedPath(_)
            | Error::OutsideRoot(_) => StatusCode::BAD_REQUEST,
            Error::Storage(_)
            | Error::Template(_)
            | Error::JsonSerialization(_)
            | Error::Io(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let storage = match state.store.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };

    Json(serde_json::json!({
        "status": "healthy",
        "service": "metalboot-server",
        "storage": storage
    }))
}

/// Resolver cache and power worker counters
pub async fn get_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let CacheStats {
        hits,
        misses,
        evictions,
    } = state.resolver.cache().stats();

    Json(serde_json::json!({
        "service": "metalboot-server",
        "cache": {
            "entries": state.resolver.cache().len(),
            "hits": hits,
            "misses": misses,
            "evictions": evictions
        },
        "power_actions_scheduled": state.power.scheduled()
    }))
}

fn plain_text(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn respond(boot: BootResponse, request: Request) -> Response {
    match boot {
        BootResponse::Script(script) => plain_text(script),
        BootResponse::File(path) => match ServeFile::new(&path).oneshot(request).await {
            Ok(response) => response.map(Body::new),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        },
        BootResponse::NotFound(reason) => (StatusCode::NOT_FOUND, reason).into_response(),
    }
}

/// `GET|HEAD /boot/{*path}`
pub async fn boot_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    debug!(path = %path, "boot request");
    let boot = state.boot.serve_path(&path).await;
    respond(boot, request).await
}

/// `GET|HEAD /bootstrap/{*path}`
pub async fn bootstrap_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    let boot = state.boot.serve_path(&format!("bootstrap/{}", path)).await;
    respond(boot, request).await
}

/// Values of the `X-RHN-Provisioning-MAC-<n>` headers, ordered by `<n>`
pub fn provisioning_headers(headers: &HeaderMap) -> Vec<String> {
    const PREFIX: &str = "x-rhn-provisioning-mac-";

    let mut found: Vec<(u32, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let index = name.as_str().strip_prefix(PREFIX)?;
            let value = value.to_str().ok()?;
            Some((index.parse().unwrap_or(u32::MAX), value.to_string()))
        })
        .collect();
    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, value)| value).collect()
}

/// `GET /ks/`
pub async fn kickstart_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let values = provisioning_headers(&headers);
    debug!(reported = values.len(), "kickstart request");
    plain_text(state.boot.kickstart(&values).await)
}

/// `POST /done/{uuid}`
pub async fn done_handler(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> StatusCode {
    match state.completion.complete(&uuid).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            info!(install_uuid = %uuid, error = %e, "rejecting completion signal");
            StatusCode::BAD_REQUEST
        }
    }
}

/// `GET|HEAD /logs/{system}`, the collected installer log of a system
pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Path(pattern): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let system = state.store.find_system(&pattern).await?;
    let hostname = system_hostname(&system.name, system.id);
    let path = logstore::log_path(&state.config.logs_dir, &hostname)
        .filter(|path| path.is_file())
        .ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("no logs for system {} ({})", system.id, hostname),
        })?;

    debug!(system_id = system.id, file = %path.display(), "serving installer log");
    Ok(respond(BootResponse::File(path), request).await)
}
