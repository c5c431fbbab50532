use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from TOML with env-var overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub bus: BusSettings,
    pub storage: StorageConfig,
    pub workers: WorkerSettings,
    pub weather: WeatherSettings,
    pub push: PushSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub redis_url: String,
    pub publish_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    pub unsubscribe_timeout_secs: u64,
    /// Per-subscriber event buffer; events past this are dropped, not queued.
    pub buffer_size: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            publish_timeout_secs: 5,
            subscribe_timeout_secs: 10,
            unsubscribe_timeout_secs: 5,
            buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub postgres_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgres://localhost/wayfarer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub queue_size: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_size: 256,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub refresh_interval_secs: u64,
    /// Identifying user agent; the fallback geocoder rejects requests
    /// without one.
    pub user_agent: String,
    pub geocoder_url: String,
    pub fallback_geocoder_url: String,
    pub forecast_url: String,
    pub request_timeout_secs: u64,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 900,
            user_agent: "wayfarer/0.1 (trip-coordination backend)".to_string(),
            geocoder_url: "https://geocoding-api.open-meteo.com/v1/search".to_string(),
            fallback_geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    pub endpoint: String,
    /// Max recipients per outbound request; the vendor caps this at 100.
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://exp.host/--/api/v2/push/send".to_string(),
            batch_size: 100,
            request_timeout_secs: 30,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SystemConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config from defaults plus environment only, for containerized runs
    /// without a config file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WAYFARER_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_REDIS_URL") {
            self.bus.redis_url = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_POSTGRES_URL") {
            self.storage.postgres_url = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_PUSH_ENDPOINT") {
            self.push.endpoint = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_WEATHER_USER_AGENT") {
            self.weather.user_agent = v;
        }
        if let Some(v) = env_u64("WAYFARER_PUBLISH_TIMEOUT_SECS") {
            self.bus.publish_timeout_secs = v;
        }
        if let Some(v) = env_u64("WAYFARER_SUBSCRIBE_TIMEOUT_SECS") {
            self.bus.subscribe_timeout_secs = v;
        }
        if let Some(v) = env_u64("WAYFARER_BUS_BUFFER_SIZE") {
            self.bus.buffer_size = v as usize;
        }
        if let Some(v) = env_u64("WAYFARER_WORKER_POOL_SIZE") {
            self.workers.pool_size = v as usize;
        }
        if let Some(v) = env_u64("WAYFARER_WORKER_QUEUE_SIZE") {
            self.workers.queue_size = v as usize;
        }
        if let Some(v) = env_u64("WAYFARER_SHUTDOWN_TIMEOUT_SECS") {
            self.workers.shutdown_timeout_secs = v;
        }
        if let Some(v) = env_u64("WAYFARER_WEATHER_REFRESH_SECS") {
            self.weather.refresh_interval_secs = v;
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
