use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Operator secret the vault key is derived from. Prefer `GATEWAY_SECRET_KEY`.
    #[serde(default)]
    pub secret_key: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty disables cross-origin access.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8365
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/gateway.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Identity provider registration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_authority_base")]
    pub authority_base: String,
    /// Delegated scopes. Reserved scopes listed here are stripped before use.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// How long a login `state` value stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
}

fn default_redirect_uri() -> String {
    "http://localhost:8365/auth/callback".to_string()
}

fn default_authority_base() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "User.Read",
        "Mail.ReadWrite",
        "Mail.Send",
        "Calendars.ReadWrite",
        "Files.ReadWrite.All",
        "offline_access",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_state_ttl() -> i64 {
    600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: String::new(),
            redirect_uri: default_redirect_uri(),
            authority_base: default_authority_base(),
            scopes: default_scopes(),
            state_ttl_seconds: default_state_ttl(),
        }
    }
}

impl OAuthConfig {
    fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_base.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority())
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }
}

/// Upstream API client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Maximum items accepted by one batch request
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
}

fn default_max_batch_items() -> usize {
    1000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_batch_items: default_max_batch_items(),
        }
    }
}

impl GatewayConfig {
    /// Overlays `GATEWAY_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GATEWAY_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("GATEWAY_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Some(v) = lookup("GATEWAY_CORS_ORIGINS") {
            self.server.cors_origins = split_list(&v);
        }
        if let Some(v) = lookup("GATEWAY_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("GATEWAY_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup("GATEWAY_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = lookup("GATEWAY_TENANT_ID") {
            self.oauth.tenant_id = v;
        }
        if let Some(v) = lookup("GATEWAY_REDIRECT_URI") {
            self.oauth.redirect_uri = v;
        }
        if let Some(v) = lookup("GATEWAY_SCOPES") {
            self.oauth.scopes = split_list(&v);
        }
        if let Some(v) = lookup("GATEWAY_UPSTREAM_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = lookup("GATEWAY_UPSTREAM_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.upstream.timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("GATEWAY_SECRET_KEY") {
            self.secret_key = v;
        }
    }

    /// Rejects configurations the gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            bail!("secret_key is required (set GATEWAY_SECRET_KEY)");
        }
        if self.upstream.timeout_seconds == 0 {
            bail!("upstream.timeout_seconds must be greater than 0");
        }
        if self.api.max_batch_items == 0 {
            bail!("api.max_batch_items must be greater than 0");
        }
        if self.oauth.state_ttl_seconds <= 0 {
            bail!("oauth.state_ttl_seconds must be greater than 0");
        }
        Ok(())
    }
}

/// Splits a comma or space separated list, dropping empty entries.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// A missing file is not an error: defaults plus environment are used.
pub fn load_config(path: &str) -> Result<GatewayConfig> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file {}", path));
        }
    };

    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8365);
        assert_eq!(config.database.path, "data/gateway.db");
        assert_eq!(config.upstream.base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(config.upstream.timeout_seconds, 30);
        assert_eq!(config.oauth.state_ttl_seconds, 600);
        assert_eq!(config.api.max_batch_items, 1000);
        assert!(config.oauth.scopes.contains(&"offline_access".to_string()));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            secret_key = "from-file"

            [server]
            host = "0.0.0.0"
            port = 9000
            cors_origins = ["http://localhost:3000"]

            [database]
            path = "/var/lib/gateway/gateway.db"

            [oauth]
            client_id = "client-123"
            tenant_id = "contoso"
            scopes = ["User.Read"]

            [upstream]
            timeout_seconds = 10

            [api]
            max_batch_items = 50
        "#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.database.path, "/var/lib/gateway/gateway.db");
        assert_eq!(config.oauth.client_id, "client-123");
        assert_eq!(config.oauth.scopes, vec!["User.Read"]);
        assert_eq!(config.upstream.timeout_seconds, 10);
        assert_eq!(config.api.max_batch_items, 50);
        assert_eq!(config.secret_key, "from-file");
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [server]
            port = 9100
        "#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1"); // Default
        assert_eq!(config.api.max_batch_items, 1000); // Default
    }

    #[test]
    fn test_oauth_endpoints() {
        let oauth = OAuthConfig {
            tenant_id: "contoso".to_string(),
            authority_base: "https://login.example.com/".to_string(),
            ..OAuthConfig::default()
        };
        assert_eq!(
            oauth.authorize_url(),
            "https://login.example.com/contoso/oauth2/v2.0/authorize"
        );
        assert_eq!(
            oauth.token_url(),
            "https://login.example.com/contoso/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GATEWAY_PORT", "9200"),
            ("GATEWAY_SECRET_KEY", "s3cret"),
            ("GATEWAY_SCOPES", "User.Read, Mail.Send"),
            ("GATEWAY_UPSTREAM_TIMEOUT_SECONDS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9200);
        assert_eq!(config.secret_key, "s3cret");
        assert_eq!(config.oauth.scopes, vec!["User.Read", "Mail.Send"]);
        // Unparseable values keep the previous setting
        assert_eq!(config.upstream.timeout_seconds, 30);
    }

    #[test]
    fn test_validate() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());

        config.secret_key = "s3cret".to_string();
        assert!(config.validate().is_ok());

        config.api.max_batch_items = 0;
        assert!(config.validate().is_err());
    }
}
