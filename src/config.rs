use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    load_dotenv_from(Path::new(".env"));
}

fn load_dotenv_from(env_path: &Path) {
    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(&key).is_err() {
            // SAFETY: called at startup before any other thread reads the environment
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            pairs.push((key.to_string(), value.to_string()));
        }
    }

    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub telemetry: TelemetryConfig,
    pub mqtt: MqttConfig,
    pub firebase: FirebaseConfig,
    pub liveness: LivenessConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which realtime store carries door/timer telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TelemetryBackend {
    Mqtt,
    Firebase,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub backend: TelemetryBackend,
    pub read_timeout_secs: u64,
}

impl TelemetryConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prepended to every telemetry path, e.g. `fridges` -> `fridges/42/timer/timer`
    pub topic_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseConfig {
    pub database_url: Option<String>,
    /// Database secret or ID token appended as `?auth=`
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Must exceed the slowest device heartbeat period with margin.
    pub poll_interval_secs: u64,
    pub roster_refresh_secs: u64,
}

impl LivenessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn roster_refresh(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub path: PathBuf,
}

/// Default location of the persisted session file.
pub fn default_session_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fridge-monitor")
        .join("session.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://shecker-admin.com/api".to_string(),
                timeout_secs: 10,
            },
            telemetry: TelemetryConfig {
                backend: TelemetryBackend::Mqtt,
                read_timeout_secs: 5,
            },
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: "fridge-monitor".to_string(),
                username: None,
                password: None,
                topic_prefix: None,
            },
            firebase: FirebaseConfig {
                database_url: None,
                auth: None,
            },
            liveness: LivenessConfig {
                poll_interval_secs: 10,
                roster_refresh_secs: 60,
            },
            session: SessionConfig {
                path: default_session_path(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // REST API
        if let Some(url) = var("API_BASE_URL") {
            config.api.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = var("API_TIMEOUT_SECS")
            && let Ok(s) = secs.parse()
        {
            config.api.timeout_secs = s;
        }

        // Telemetry
        if let Some(backend) = var("TELEMETRY_BACKEND") {
            match backend.parse() {
                Ok(b) => config.telemetry.backend = b,
                Err(_) => log::warn!("Unknown TELEMETRY_BACKEND '{}', keeping default", backend),
            }
        }
        if let Some(secs) = var("TELEMETRY_READ_TIMEOUT_SECS")
            && let Ok(s) = secs.parse()
        {
            config.telemetry.read_timeout_secs = s;
        }

        // MQTT configuration
        if let Some(host) = var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Some(client_id) = var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Some(username) = var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Some(password) = var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Some(prefix) = var("MQTT_TOPIC_PREFIX") {
            config.mqtt.topic_prefix = Some(prefix.trim_matches('/').to_string());
        }

        // Firebase configuration
        if let Some(url) = var("FIREBASE_DATABASE_URL") {
            config.firebase.database_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(auth) = var("FIREBASE_AUTH") {
            config.firebase.auth = Some(auth);
        }

        // Liveness
        if let Some(secs) = var("LIVENESS_POLL_INTERVAL_SECS")
            && let Ok(s) = secs.parse::<u64>()
            && s > 0
        {
            config.liveness.poll_interval_secs = s;
        }
        if let Some(secs) = var("ROSTER_REFRESH_SECS")
            && let Ok(s) = secs.parse::<u64>()
            && s > 0
        {
            config.liveness.roster_refresh_secs = s;
        }

        if let Some(path) = var("SESSION_PATH") {
            config.session.path = PathBuf::from(path);
        }

        config
    }
}
