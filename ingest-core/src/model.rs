use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Geographic position of a city, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// A city the ingester keeps a time series for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityConfig {
    /// Display name, also the key in the run report.
    pub name: String,

    /// Geocoding query, e.g. "Cape Town,ZA". Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Store file name inside the data directory. Defaults to `<slug>_weather.csv`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Fixed coordinates; when present the city is never geocoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

impl CityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), query: None, file: None, coordinates: None }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_coordinates(mut self, lat: f64, lon: f64) -> Self {
        self.coordinates = Some(Coordinates { lat, lon });
        self
    }

    pub fn geocoding_query(&self) -> &str {
        self.query.as_deref().unwrap_or(&self.name)
    }

    pub fn file_name(&self) -> String {
        match &self.file {
            Some(file) => file.clone(),
            None => format!("{}_weather.csv", slug(&self.name)),
        }
    }
}

/// Temperature and humidity for one hour, as returned by a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourlyObservation {
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

/// One stored row of a city's time series.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    pub city: String,
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

impl WeatherReading {
    pub fn from_observation(
        city: impl Into<String>,
        timestamp: DateTime<Utc>,
        observation: HourlyObservation,
    ) -> Self {
        Self {
            city: city.into(),
            timestamp,
            temperature_c: observation.temperature_c,
            humidity_pct: observation.humidity_pct,
        }
    }
}

/// Drop minutes, seconds and sub-seconds.
pub fn truncate_to_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    let elapsed = i64::from(instant.minute() * 60 + instant.second());
    instant - TimeDelta::seconds(elapsed) - TimeDelta::nanoseconds(i64::from(instant.nanosecond()))
}

/// Start of the most recent hour whose 60-minute window has fully elapsed at `now`.
///
/// At 12:10 this is 11:00; at exactly 12:00:00 the 11:00 window has just
/// closed, so it is 11:00 as well.
pub fn last_complete_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_hour(now) - TimeDelta::hours(1)
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to `_`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
