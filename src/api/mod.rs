// HTTP API: key management, account linking, bulk mail jobs

pub mod auth_middleware;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod mail;
pub mod oauth;

pub use error::ApiError;
pub use jobs::{create_jobs_router, JobsAppState};
pub use keys::{create_keys_router, KeysAppState};
pub use mail::{create_mail_router, MailAppState};
pub use oauth::{create_oauth_router, OAuthAppState};

use crate::gate::AccessGate;
use crate::jobs::JobExecutor;
use crate::upstream::GraphClient;
use crate::vault::{StateManager, TokenVault};
use axum::{
    http::{header, HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared components every router draws from.
#[derive(Clone)]
pub struct Gateway {
    pub gate: Arc<AccessGate>,
    pub vault: Arc<TokenVault>,
    pub executor: Arc<JobExecutor>,
    pub client: Arc<GraphClient>,
    pub state_manager: StateManager,
    pub max_batch_items: usize,
}

/// Assembles the full application router.
pub fn create_app(gateway: Gateway, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(create_oauth_router(OAuthAppState {
            vault: Arc::clone(&gateway.vault),
            gate: Arc::clone(&gateway.gate),
            state_manager: gateway.state_manager.clone(),
        }))
        .merge(create_keys_router(KeysAppState {
            gate: Arc::clone(&gateway.gate),
        }))
        .merge(create_mail_router(MailAppState {
            gate: Arc::clone(&gateway.gate),
            executor: Arc::clone(&gateway.executor),
            client: Arc::clone(&gateway.client),
            max_batch_items: gateway.max_batch_items,
        }))
        .merge(create_jobs_router(JobsAppState {
            gate: gateway.gate,
            executor: gateway.executor,
        }))
        .layer(build_cors_layer(cors_origins))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    let mut parsed = Vec::new();
    for origin in cors_origins {
        match HeaderValue::from_str(origin) {
            Ok(value) => parsed.push(value),
            Err(e) => tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin"),
        }
    }

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(parsed)
}
