use serde::Deserialize;

/// Complete engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding applets and areas
    #[serde(default = "default_applets_db")]
    pub applets_db: String,
    /// SQLite database holding encrypted credentials
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
}

fn default_applets_db() -> String {
    "applets.db".to_string()
}

fn default_credentials_db() -> String {
    "credentials.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            applets_db: default_applets_db(),
            credentials_db: default_credentials_db(),
        }
    }
}

/// Per-applet run log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory for append-only per-applet logs
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Disable run-log files entirely (tracing events still fire)
    #[serde(default)]
    pub disabled: bool,
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            disabled: false,
        }
    }
}

/// OAuth configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Redirect URI registered with every provider
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/oauth/callback".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_uri: default_redirect_uri(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            logs: LogConfig::default(),
            oauth: OAuthConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: EngineConfig = toml::from_str(&contents)?;
    Ok(config)
}
