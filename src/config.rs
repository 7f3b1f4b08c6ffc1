use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public host name the telephony provider reaches us on (no scheme).
    #[serde(default)]
    pub domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            domain: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    /// WebSocket endpoint of the voice service.
    #[serde(default)]
    pub ws_url: String,
    /// Sent as a bearer token on connect, when set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl VoiceConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn default_reconnect_delay() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Voice-service media chunks accumulated before one combined send.
    /// Also the jitter buffer's capacity, since a full buffer is always flushed.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_flush_threshold() -> usize {
    60
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("voice.ws_url is not configured (set it in config.toml or VOICE_SERVICE_WS_URL)")]
    MissingVoiceUrl,
    #[error("voice.ws_url must start with ws:// or wss://, got {0}")]
    InvalidVoiceUrl(String),
    #[error("relay.flush_threshold must be at least 1")]
    ZeroFlushThreshold,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        // A missing file is fine as long as the environment supplies the endpoint.
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                "[voice]\n".to_string()
            }
            Err(e) => {
                return Err(format!("Failed to read config at {}: {}", path.display(), e).into())
            }
        };

        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VOICE_SERVICE_WS_URL") {
            self.voice.ws_url = v;
        }
        if let Ok(v) = std::env::var("VOICE_SERVICE_API_KEY") {
            self.voice.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = std::env::var("SERVER_DOMAIN") {
            self.server.domain = v;
        }
        if let Ok(v) = std::env::var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(port) = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.server.port = port;
        }
    }

    /// Reject configurations no call could be served with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.voice.ws_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingVoiceUrl);
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidVoiceUrl(url.to_string()));
        }
        if self.relay.flush_threshold == 0 {
            return Err(ConfigError::ZeroFlushThreshold);
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("MEDIA_BRIDGE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".media-bridge")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("MEDIA_BRIDGE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
