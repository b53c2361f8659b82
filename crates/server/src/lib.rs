//! Metalboot Server
//!
//! Network boot server for bare-metal provisioning. Resolves booting
//! machines by hardware address, serves loader scripts, kernels and
//! kickstarts over TFTP and HTTP, and power cycles machines back to local
//! disk once their installer reports completion.

pub mod admin;
pub mod boot;
pub mod cache;
pub mod completion;
pub mod config;
pub mod handlers;
pub mod hostname;
pub mod lifecycle;
pub mod logstore;
pub mod models;
pub mod power;
pub mod request;
pub mod resolver;
pub mod storage;
pub mod templates;
pub mod tftp;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use boot::{BootResponse, BootService};
pub use cache::{CacheStats, ResolutionCache};
pub use config::Config;
pub use handlers::AppState;
pub use lifecycle::{Lifecycle, Transition};
pub use logstore::SyslogServer;
pub use power::{PowerAction, PowerQueue};
pub use resolver::{Resolution, Resolver};
pub use storage::{MemoryStore, RedisStore, Store};
pub use tftp::TftpServer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::get_stats_handler))
        // boot surface
        .route("/boot/{*path}", get(handlers::boot_handler))
        .route("/bootstrap/{*path}", get(handlers::bootstrap_handler))
        .route("/ks", get(handlers::kickstart_handler))
        .route("/ks/", get(handlers::kickstart_handler))
        .route("/done/{uuid}", post(handlers::done_handler))
        .route("/logs/{system}", get(handlers::logs_handler))
        // administration
        .route(
            "/api/systems",
            get(admin::list_systems_handler).post(admin::register_system_handler),
        )
        .route("/api/systems/{id}", get(admin::get_system_handler))
        .route("/api/systems/{id}/reset", post(admin::reset_system_handler))
        .route("/api/appliances", post(admin::create_appliance_handler))
        .route("/api/appliances/{id}", get(admin::get_appliance_handler))
        .route("/api/appliances/{id}/enlist", post(admin::enlist_handler))
        .route("/api/images", post(admin::create_image_handler))
        .route(
            "/api/installations",
            get(admin::list_installations_handler).post(admin::deploy_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
