use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding persisted session files, one per phone number.
    #[serde(default = "default_session_home")]
    pub session_home: PathBuf,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub data_centers: DataCenterConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        let mut config: Self = serde_saphyr::from_str(&expanded)?;
        config.session_home = resolve_path(path, &config.session_home);
        Ok(config)
    }

    /// Validate settings the manager cannot run without.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.app.api_id <= 0 {
            return Err(ConfigError::Invalid("app.api_id must be set".to_string()));
        }
        if self.app.api_hash.trim().is_empty() {
            return Err(ConfigError::Invalid("app.api_hash must be set".to_string()));
        }
        if self.session_home.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "session_home must not be empty".to_string(),
            ));
        }
        if self.data_centers.default_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "data_centers.default_addr must not be empty".to_string(),
            ));
        }
        if self.manager.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "manager.request_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.manager.bind_wait_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "manager.bind_wait_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve a path relative to the config file directory.
///
/// If the path is absolute, it is returned as-is.
/// If the path is relative, it is joined with the config file's parent directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default session directory (relative to the config file).
pub const DEFAULT_SESSION_HOME: &str = ".mtlink/sessions";

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_session_home() -> PathBuf {
    PathBuf::from(DEFAULT_SESSION_HOME)
}

fn default_device_model() -> String {
    "mtlink".to_string()
}

fn default_system_version() -> String {
    std::env::consts::OS.to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_lang_code() -> String {
    "en".to_string()
}

fn default_dc_addr() -> String {
    "149.154.167.50:443".to_string()
}

fn default_dc_addresses() -> HashMap<i32, String> {
    HashMap::from([
        (1, "149.154.175.53:443".to_string()),
        (2, "149.154.167.51:443".to_string()),
        (3, "149.154.175.100:443".to_string()),
        (4, "149.154.167.91:443".to_string()),
        (5, "91.108.56.130:443".to_string()),
    ])
}

fn default_request_timeout() -> u64 {
    60
}

fn default_bind_wait_timeout() -> u64 {
    30
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `${VAR:-}` - Optional variable, empty string if not set
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// Nested expansion (`${VAR:-${DEFAULT}}`) is not supported.
///
/// ```yaml
/// app:
///   api_id: ${MTLINK_API_ID}
///   api_hash: ${MTLINK_API_HASH}
///   lang_code: ${LANG_CODE:-en}
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&parse_var_reference(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse a variable reference after seeing `${`.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;
    let mut closed = false;

    while let Some(c) = chars.next() {
        match (c, default_value.as_mut()) {
            ('}', _) => {
                closed = true;
                break;
            }
            (':', None) if chars.peek() == Some(&'-') => {
                chars.next();
                default_value = Some(String::new());
            }
            (c, Some(default)) => default.push(c),
            (c, None) => var_name.push(c),
        }
    }

    if !closed {
        return Err(ConfigError::UnclosedVarReference);
    }

    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => default_value.ok_or(ConfigError::MissingEnvVar(var_name)),
    }
}

// ============================================================================
// AppConfig
// ============================================================================

/// Client identity presented to the server during the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api_id: i32,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default = "default_device_model")]
    pub device_model: String,
    #[serde(default = "default_system_version")]
    pub system_version: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_lang_code")]
    pub lang_code: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            device_model: default_device_model(),
            system_version: default_system_version(),
            app_version: default_app_version(),
            lang_code: default_lang_code(),
        }
    }
}

// ============================================================================
// DataCenterConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DataCenterConfig {
    /// Endpoint used for a first login when no data center is known yet.
    #[serde(default = "default_dc_addr")]
    pub default_addr: String,
    #[serde(default)]
    pub use_ipv6: bool,
    /// Endpoint per data center id, used to follow `*_MIGRATE_<dc>` redirects.
    #[serde(default = "default_dc_addresses")]
    pub addresses: HashMap<i32, String>,
}

impl DataCenterConfig {
    pub fn addr_of(&self, dc: i32) -> Option<&str> {
        self.addresses.get(&dc).map(String::as_str)
    }
}

impl Default for DataCenterConfig {
    fn default() -> Self {
        Self {
            default_addr: default_dc_addr(),
            use_ipv6: false,
            addresses: default_dc_addresses(),
        }
    }
}

// ============================================================================
// ManagerConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on a single façade request (authenticate, load, create).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// How long a refresh waits for its target session to be bound.
    #[serde(default = "default_bind_wait_timeout")]
    pub bind_wait_timeout_seconds: u64,
}

impl ManagerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn bind_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_wait_timeout_seconds)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            bind_wait_timeout_seconds: default_bind_wait_timeout(),
        }
    }
}
