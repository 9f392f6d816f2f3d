use crate::auth::{
    AzureCliTokenProvider, ClientSecretTokenProvider, ConnectionString, Credential,
    StaticTokenProvider, normalize_host,
};
use crate::disposition::{CoordinatorSettings, RawBrowseSettings};
use crate::transport::amqp::BrokerSettings;
use crate::transport::{Endpoint, DEFAULT_AMQPS_PORT};
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

pub const CONFIG_DIR_ENV: &str = "SBCLI_CONFIG_DIR";
pub const CONNECTION_STRING_ENV: &str = "SBCLI_CONNECTION_STRING";
pub const NAMESPACE_ENV: &str = "SBCLI_NAMESPACE";
pub const ACCESS_TOKEN_ENV: &str = "SBCLI_ACCESS_TOKEN";
pub const LOG_FILE_ENV: &str = "SBCLI_LOG_FILE";

const CONFIG_FILE: &str = "config.toml";

// ── Sections ─────────────────────────────────────────────────────

/// Root configuration, stored at `~/.sbcli/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Path the config was loaded from (computed, not serialized)
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub pager: PagerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker endpoint and protocol constants.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Namespace host, e.g. `contoso.servicebus.windows.net`
    #[serde(default)]
    pub namespace: Option<String>,
    /// Shared access connection string (primary credential or federated fallback)
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Scheme of CBS audiences for federated tokens (default: amqp)
    #[serde(default = "default_cbs_audience_scheme")]
    pub cbs_audience_scheme: String,
    /// Scheme of SAS token audiences (default: sb)
    #[serde(default = "default_sas_audience_scheme")]
    pub sas_audience_scheme: String,
    /// CBS token types tried in order
    #[serde(default = "default_token_types")]
    pub token_types: Vec<String>,
    /// AMQPS port (default: 5671)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Present shared keys as SAS tokens over CBS instead of SASL PLAIN
    #[serde(default)]
    pub shared_key_cbs: bool,
}

fn default_cbs_audience_scheme() -> String {
    "amqp".into()
}

fn default_sas_audience_scheme() -> String {
    "sb".into()
}

fn default_token_types() -> Vec<String> {
    vec!["jwt".into(), "servicebus.windows.net:jwt".into()]
}

fn default_port() -> u16 {
    DEFAULT_AMQPS_PORT
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            connection_string: None,
            cbs_audience_scheme: default_cbs_audience_scheme(),
            sas_audience_scheme: default_sas_audience_scheme(),
            token_types: default_token_types(),
            port: default_port(),
            shared_key_cbs: false,
        }
    }
}

/// How credentials are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// `az account get-access-token`
    Cli,
    /// OAuth2 client credentials
    ClientSecret,
    /// A pre-acquired bearer token
    Token,
    /// The connection string's shared access key
    SharedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct AuthConfig {
    /// Unset picks token, then shared-key, then cli
    #[serde(default)]
    pub mode: Option<AuthMode>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutsConfig {
    /// Connection establishment deadline (default: 30)
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Wait for each CBS reply (default: 5)
    #[serde(default = "default_cbs_response_secs")]
    pub cbs_response_secs: u64,
    /// Wait for locked messages (default: 5)
    #[serde(default = "default_lock_receive_secs")]
    pub lock_receive_secs: u64,
    /// Deadline for `verify` (default: 4)
    #[serde(default = "default_verify_secs")]
    pub verify_secs: u64,
    /// Management and send round-trips (default: 30)
    #[serde(default = "default_operation_secs")]
    pub operation_secs: u64,
}

fn default_connect_secs() -> u64 {
    30
}

fn default_cbs_response_secs() -> u64 {
    5
}

fn default_lock_receive_secs() -> u64 {
    5
}

fn default_verify_secs() -> u64 {
    4
}

fn default_operation_secs() -> u64 {
    30
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            cbs_response_secs: default_cbs_response_secs(),
            lock_receive_secs: default_lock_receive_secs(),
            verify_secs: default_verify_secs(),
            operation_secs: default_operation_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PagerConfig {
    /// Messages per page (default: 20)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    20
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct LoggingConfig {
    /// Log file; defaults to `~/.sbcli/logs/sbcli_<timestamp>.log`
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset (default: info)
    #[serde(default)]
    pub level: Option<String>,
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".sbcli"))
}

/// `--config-dir` > `SBCLI_CONFIG_DIR` > `~/.sbcli`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => default_config_dir(),
    }
}

impl Config {
    /// Load `config.toml` from `config_dir`, writing defaults when it is missing.
    pub async fn load_or_init(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        fs::create_dir_all(config_dir)
            .await
            .with_context(|| format!("Failed to create config directory {}", config_dir.display()))?;

        let mut config = if config_path.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}) and may hold keys. \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to serialize default config")?;
            fs::write(&config_path, rendered)
                .await
                .context("Failed to write default config")?;
            config
        };

        config.config_path = config_path;
        Ok(config)
    }

    /// Apply `SBCLI_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(cs) = non_empty(CONNECTION_STRING_ENV) {
            self.broker.connection_string = Some(cs);
        }
        if let Some(ns) = non_empty(NAMESPACE_ENV) {
            self.broker.namespace = Some(ns);
        }
        if let Some(token) = non_empty(ACCESS_TOKEN_ENV) {
            self.auth.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.cbs_audience_scheme.trim().is_empty() {
            anyhow::bail!("broker.cbs_audience_scheme must not be empty");
        }
        if self.broker.sas_audience_scheme.trim().is_empty() {
            anyhow::bail!("broker.sas_audience_scheme must not be empty");
        }
        if self.broker.token_types.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("broker.token_types must list at least one token type");
        }
        if self.broker.port == 0 {
            anyhow::bail!("broker.port must be greater than 0");
        }
        if self.pager.page_size == 0 {
            anyhow::bail!("pager.page_size must be greater than 0");
        }
        let timeouts = [
            ("connect_secs", self.timeouts.connect_secs),
            ("cbs_response_secs", self.timeouts.cbs_response_secs),
            ("lock_receive_secs", self.timeouts.lock_receive_secs),
            ("verify_secs", self.timeouts.verify_secs),
            ("operation_secs", self.timeouts.operation_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                anyhow::bail!("timeouts.{name} must be greater than 0");
            }
        }
        if self.auth.mode == Some(AuthMode::ClientSecret)
            && (self.auth.tenant_id.is_none()
                || self.auth.client_id.is_none()
                || self.auth.client_secret.is_none())
        {
            anyhow::bail!("auth.mode = client-secret requires tenant_id, client_id and client_secret");
        }
        Ok(())
    }

    // ── Runtime views ────────────────────────────────────────────

    pub fn connection_string(&self) -> Option<ConnectionString> {
        self.broker
            .connection_string
            .as_deref()
            .map(ConnectionString::parse)
    }

    /// Namespace host from config, else from the connection string endpoint.
    pub fn namespace_host(&self) -> Result<String> {
        self.broker
            .namespace
            .as_deref()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .or_else(|| self.connection_string().and_then(|cs| cs.host()))
            .context("No namespace configured (set broker.namespace, --namespace or SBCLI_NAMESPACE)")
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::new(self.namespace_host()?).with_port(self.broker.port))
    }

    pub fn effective_auth_mode(&self) -> AuthMode {
        if let Some(mode) = self.auth.mode {
            return mode;
        }
        if self.auth.token.is_some() {
            AuthMode::Token
        } else if self.connection_string().is_some_and(|cs| cs.shared_key().is_some()) {
            AuthMode::SharedKey
        } else {
            AuthMode::Cli
        }
    }

    pub fn credential(&self) -> Result<Credential> {
        let fallback = self.connection_string().and_then(|cs| cs.shared_key());
        let credential = match self.effective_auth_mode() {
            AuthMode::SharedKey => {
                let key = fallback
                    .clone()
                    .context("Invalid connection string (missing Endpoint/KeyName/Key).")?;
                return Ok(Credential::SharedKey(key));
            }
            AuthMode::Token => {
                let token = self
                    .auth
                    .token
                    .clone()
                    .context("auth.mode = token requires auth.token or SBCLI_ACCESS_TOKEN")?;
                Credential::federated(Arc::new(StaticTokenProvider::new(token)))
            }
            AuthMode::Cli => Credential::federated(Arc::new(AzureCliTokenProvider::default())),
            AuthMode::ClientSecret => {
                let (Some(tenant), Some(client), Some(secret)) = (
                    self.auth.tenant_id.clone(),
                    self.auth.client_id.clone(),
                    self.auth.client_secret.clone(),
                ) else {
                    anyhow::bail!(
                        "auth.mode = client-secret requires tenant_id, client_id and client_secret"
                    );
                };
                Credential::federated(Arc::new(ClientSecretTokenProvider::new(
                    tenant, client, secret,
                )))
            }
        };
        Ok(credential.with_fallback(fallback))
    }

    fn token_types(&self) -> Vec<String> {
        self.broker
            .token_types
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn broker_settings(&self) -> Result<BrokerSettings> {
        Ok(BrokerSettings {
            endpoint: self.endpoint()?,
            cbs_audience_scheme: self.broker.cbs_audience_scheme.clone(),
            sas_audience_scheme: self.broker.sas_audience_scheme.clone(),
            token_types: self.token_types(),
            shared_key_cbs: self.broker.shared_key_cbs,
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            cbs_response_timeout: Duration::from_secs(self.timeouts.cbs_response_secs),
            operation_timeout: Duration::from_secs(self.timeouts.operation_secs),
        })
    }

    pub fn coordinator_settings(&self) -> Result<CoordinatorSettings> {
        Ok(CoordinatorSettings {
            lock_timeout: Duration::from_secs(self.timeouts.lock_receive_secs),
            settle_timeout: Duration::from_secs(self.timeouts.operation_secs),
            raw: RawBrowseSettings {
                endpoint: self.endpoint()?,
                cbs_audience_scheme: self.broker.cbs_audience_scheme.clone(),
                token_types: self.token_types(),
                connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
                cbs_response_timeout: Duration::from_secs(self.timeouts.cbs_response_secs),
                settle_timeout: Duration::from_secs(self.timeouts.operation_secs),
            },
        })
    }
}

/// JSON schema of [`Config`], pretty-printed.
pub fn config_json_schema() -> Result<String> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_string_pretty(&schema).context("Failed to render config schema")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_init(dir.path()).await.unwrap();

        assert_eq!(config.pager.page_size, 20);
        assert_eq!(config.broker.port, 5671);
        assert_eq!(config.broker.cbs_audience_scheme, "amqp");
        assert_eq!(config.broker.sas_audience_scheme, "sb");
        assert_eq!(config.timeouts.connect_secs, 30);
        assert!(dir.path().join("config.toml").exists());
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[broker]\nnamespace = \"sb://contoso.servicebus.windows.net/\"\n\n[pager]\npage_size = 5\n",
        )
        .unwrap();

        let config = Config::load_or_init(dir.path()).await.unwrap();
        assert_eq!(config.pager.page_size, 5);
        assert_eq!(config.broker.token_types.len(), 2);
        assert_eq!(
            config.namespace_host().unwrap(),
            "contoso.servicebus.windows.net"
        );
    }

    #[test]
    fn validate_rejects_zero_page_size_and_timeouts() {
        let mut config = Config::default();
        config.pager.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeouts.cbs_response_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cbs_response_secs"));
    }

    #[test]
    fn validate_rejects_empty_schemes_and_token_types() {
        let mut config = Config::default();
        config.broker.cbs_audience_scheme = " ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.token_types.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (CONNECTION_STRING_ENV, "Endpoint=sb://a.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k"),
            (ACCESS_TOKEN_ENV, "tok"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.auth.token.as_deref(), Some("tok"));
        assert_eq!(config.effective_auth_mode(), AuthMode::Token);
        assert_eq!(config.namespace_host().unwrap(), "a.servicebus.windows.net");
        match config.credential().unwrap() {
            Credential::Federated { fallback, .. } => assert!(fallback.is_some()),
            Credential::SharedKey(_) => panic!("expected federated credential"),
        }
    }

    #[test]
    fn connection_string_alone_selects_shared_key() {
        let mut config = Config::default();
        config.broker.connection_string = Some(
            "Endpoint=sb://a.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k"
                .into(),
        );
        assert_eq!(config.effective_auth_mode(), AuthMode::SharedKey);
        assert!(matches!(config.credential().unwrap(), Credential::SharedKey(_)));
    }

    #[test]
    fn shared_key_mode_without_key_fails() {
        let mut config = Config::default();
        config.auth.mode = Some(AuthMode::SharedKey);
        let err = config.credential().unwrap_err().to_string();
        assert!(err.contains("Invalid connection string"));
    }

    #[test]
    fn missing_namespace_is_an_error() {
        assert!(Config::default().endpoint().is_err());
    }

    #[test]
    fn schema_mentions_sections() {
        let schema = config_json_schema().unwrap();
        assert!(schema.contains("broker"));
        assert!(schema.contains("page_size"));
    }
}
