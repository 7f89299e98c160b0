use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::model::CityConfig;

/// Environment variable holding the OpenWeather API key.
pub const API_KEY_ENV: &str = "OPEN_WEATHER_API_KEY";

/// OpenWeather endpoint settings and optional fallback credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenWeatherConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Used only when `OPEN_WEATHER_API_KEY` is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for OpenWeatherConfig {
    fn default() -> Self {
        Self { base_url: default_base_url(), api_key: None }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// data_dir = "weather_data"
///
/// [openweather]
/// api_key = "..."
///
/// [[cities]]
/// name = "Cape Town"
/// query = "Cape Town,ZA"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one CSV file per city.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    #[serde(default)]
    pub openweather: OpenWeatherConfig,

    #[serde(default = "default_cities")]
    pub cities: Vec<CityConfig>,
}

fn default_base_url() -> String {
    "https://api.openweathermap.org".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("weather_data")
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_store_timeout() -> u64 {
    5
}

fn default_cities() -> Vec<CityConfig> {
    vec![
        CityConfig::new("Cape Town").with_query("Cape Town,ZA"),
        CityConfig::new("Kigali").with_query("Kigali,RW"),
        CityConfig::new("Kampala").with_query("Kampala,UG"),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            request_timeout_secs: default_request_timeout(),
            store_timeout_secs: default_store_timeout(),
            openweather: OpenWeatherConfig::default(),
            cities: default_cities(),
        }
    }
}

impl Config {
    /// Load config from an explicit path, or defaults if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, use defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-ingest", "weather-ingest")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!("No cities configured; add at least one [[cities]] entry.");
        }
        if self.request_timeout_secs == 0 || self.store_timeout_secs == 0 {
            bail!("Timeouts must be at least one second.");
        }

        let mut names = HashSet::new();
        let mut files = HashSet::new();
        for city in &self.cities {
            if city.name.trim().is_empty() {
                bail!("City names must not be empty.");
            }
            if !names.insert(city.name.as_str()) {
                bail!("City '{}' is configured more than once.", city.name);
            }
            if !files.insert(city.file_name()) {
                bail!("City '{}' shares its store file with another city.", city.name);
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Set/replace the fallback API key stored in the config file.
    pub fn set_api_key(&mut self, api_key: String) {
        self.openweather.api_key = Some(api_key);
    }
}

/// OpenWeather API key, resolved once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Environment first, then the config file. A missing key aborts the run.
    pub fn resolve(config: &Config) -> Result<Self> {
        Self::resolve_with(std::env::var(API_KEY_ENV).ok(), config)
    }

    pub fn resolve_with(env_value: Option<String>, config: &Config) -> Result<Self> {
        let non_empty = |s: &String| !s.trim().is_empty();

        env_value
            .filter(non_empty)
            .or_else(|| config.openweather.api_key.clone().filter(non_empty))
            .map(|key| Self(key.trim().to_string()))
            .ok_or_else(|| {
                anyhow!(
                    "No OpenWeather API key configured.\n\
                     Hint: set {API_KEY_ENV} or run `weather-ingest configure`."
                )
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}
