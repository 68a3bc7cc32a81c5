//! Process bootstrap: wires components from configuration and serves HTTP.

use crate::api::{create_app, Gateway};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::crypto;
use crate::gate::permissions::TierTable;
use crate::gate::store::ApiKeyStore;
use crate::gate::AccessGate;
use crate::jobs::JobExecutor;
use crate::upstream::GraphClient;
use crate::vault::{run_state_cleanup, HttpTokenExchange, StateManager, TokenVault};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// How often expired login states are purged (seconds)
const STATE_CLEANUP_INTERVAL: u64 = 300;

/// Opens the key store and builds the gate. Shared by the server and the CLI.
pub fn build_gate(config: &GatewayConfig, audit: Arc<dyn AuditSink>) -> Result<AccessGate> {
    let tiers = TierTable::load().context("Invalid permission tier table")?;
    ensure_parent_dir(&config.database.path)?;
    let store = Arc::new(
        ApiKeyStore::new(&config.database.path).context("Failed to open API key store")?,
    );
    Ok(AccessGate::new(store, tiers, audit))
}

/// Builds every component from `config`.
pub fn build_gateway(config: &GatewayConfig) -> Result<Gateway> {
    config.validate()?;

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let gate = Arc::new(build_gate(config, Arc::clone(&audit))?);

    let key = crypto::derive_key(&config.secret_key).context("Failed to derive vault key")?;
    let credentials = Arc::new(
        CredentialStore::new(&config.database.path).context("Failed to open credential store")?,
    );
    let exchange = Arc::new(HttpTokenExchange::new(
        &config.oauth,
        config.upstream.timeout(),
    )?);
    let vault = Arc::new(TokenVault::new(
        credentials,
        key,
        exchange,
        &config.oauth.scopes,
        Arc::clone(&audit),
    ));

    let executor = Arc::new(
        JobExecutor::new(&config.database.path, Arc::clone(&audit))
            .context("Failed to open job store")?,
    );
    let client = Arc::new(GraphClient::new(&config.upstream, Arc::clone(&vault))?);

    if config.oauth.client_id.is_empty() || config.oauth.tenant_id.is_empty() {
        warn!("oauth.client_id / oauth.tenant_id not set; /auth/login will not work");
    }

    Ok(Gateway {
        gate,
        vault,
        executor,
        client,
        state_manager: StateManager::new(config.oauth.state_ttl_seconds),
        max_batch_items: config.api.max_batch_items,
    })
}

/// Runs the HTTP server until Ctrl-C.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let gateway = build_gateway(&config)?;

    tokio::spawn(run_state_cleanup(
        gateway.state_manager.clone(),
        STATE_CLEANUP_INTERVAL,
    ));

    let app = create_app(gateway, &config.server.cors_origins);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, db = %config.database.path, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn ensure_parent_dir(db_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
