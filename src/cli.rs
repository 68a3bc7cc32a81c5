//! Command line: run the server or manage API keys as the local operator.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use m365_gateway::audit::{AuditSink, TracingAuditSink};
use m365_gateway::config::{load_config, GatewayConfig};
use m365_gateway::gate::permissions::Permission;
use m365_gateway::gate::{AccessGate, Caller, GateError, NewKey};
use m365_gateway::server;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "m365-gateway", about = "M365 API gateway", version, long_about = None)]
pub(crate) struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "GATEWAY_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Create one API key
    CreateKey(CreateKeyArgs),
    /// Create the standard bootstrap keys, skipping names that exist
    CreateInitialKeys,
    /// List all keys
    ListKeys,
    /// Revoke a key by name
    RevokeKey(RevokeKeyArgs),
}

#[derive(Debug, Args)]
struct CreateKeyArgs {
    /// Unique key name
    #[arg(long)]
    name: String,

    /// Permission tier (openclaw, readonly, full)
    #[arg(long, conflicts_with = "permissions")]
    tier: Option<String>,

    /// Explicit permissions, comma separated
    #[arg(long, value_delimiter = ',')]
    permissions: Option<Vec<String>>,
}

#[derive(Debug, Args)]
struct RevokeKeyArgs {
    #[arg(long)]
    name: String,
}

impl Cli {
    pub(crate) async fn run(self) -> Result<()> {
        let config = load_config(&self.config)?;

        match self.command.unwrap_or(Commands::Serve) {
            Commands::Serve => {
                info!(config = %self.config, "M365 gateway starting");
                server::serve(config).await
            }
            Commands::CreateKey(args) => create_key(&operator_gate(&config)?, args),
            Commands::CreateInitialKeys => create_initial_keys(&operator_gate(&config)?),
            Commands::ListKeys => list_keys(&operator_gate(&config)?),
            Commands::RevokeKey(args) => revoke_key(&operator_gate(&config)?, &args.name),
        }
    }
}

fn operator_gate(config: &GatewayConfig) -> Result<AccessGate> {
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    server::build_gate(config, audit)
}

fn create_key(gate: &AccessGate, args: CreateKeyArgs) -> Result<()> {
    let created = gate.create_key(
        Caller::Operator,
        NewKey {
            name: args.name,
            tier: args.tier,
            permissions: args.permissions,
        },
    )?;

    println!("key_id: {}", created.key.id);
    println!("name: {}", created.key.name);
    println!("permissions: {}", join_permissions(&created.key.permissions));
    println!("api_key: {}", created.raw_key);
    println!("store this key now; it is only shown once");
    Ok(())
}

fn create_initial_keys(gate: &AccessGate) -> Result<()> {
    let admin_permissions = Permission::ALL
        .iter()
        .map(|p| p.as_str().to_string())
        .collect::<Vec<_>>();

    let wanted = [
        NewKey {
            name: "marvin-full".to_string(),
            tier: None,
            permissions: Some(admin_permissions),
        },
        NewKey {
            name: "clawd-readonly".to_string(),
            tier: Some("readonly".to_string()),
            permissions: None,
        },
    ];

    let mut created = Vec::new();
    for request in wanted {
        match gate.find_key(Caller::Operator, &request.name) {
            Ok(existing) => {
                println!("skipped '{}' (id={}): already exists", existing.name, existing.id);
                continue;
            }
            Err(GateError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let key = gate.create_key(Caller::Operator, request)?;
        println!("created '{}' (id={})", key.key.name, key.key.id);
        created.push(key);
    }

    if created.is_empty() {
        println!("no new keys created");
        return Ok(());
    }

    for key in &created {
        println!("{}: {}", key.key.name, key.raw_key);
    }
    println!("store these keys now; they are only shown once");
    Ok(())
}

fn list_keys(gate: &AccessGate) -> Result<()> {
    let keys = gate.list_keys(Caller::Operator)?;
    if keys.is_empty() {
        println!("no API keys");
        return Ok(());
    }

    for key in keys {
        let status = if key.is_active { "active" } else { "revoked" };
        let last_used = key
            .last_used_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>4}  {:<24} {:<8} tier={} last_used={} [{}]",
            key.id,
            key.name,
            status,
            key.tier.as_deref().unwrap_or("-"),
            last_used,
            join_permissions(&key.permissions),
        );
    }
    Ok(())
}

fn revoke_key(gate: &AccessGate, name: &str) -> Result<()> {
    let key = gate.find_key(Caller::Operator, name)?;
    if !key.is_active {
        bail!("API key '{}' is already revoked", name);
    }
    let revoked = gate.revoke_key(Caller::Operator, key.id)?;
    println!("revoked '{}' (id={})", revoked.name, revoked.id);
    Ok(())
}

fn join_permissions<'a>(permissions: impl IntoIterator<Item = &'a Permission>) -> String {
    permissions
        .into_iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
