use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::{
    config::ApiKey,
    error::IngestError,
    model::{Coordinates, HourlyObservation, truncate_to_hour},
};

use super::{CoordinateResolver, HistoricalWeather};

const GEOCODING_PATH: &str = "/geo/1.0/direct";
const TIMEMACHINE_PATH: &str = "/data/3.0/onecall/timemachine";

/// OpenWeather geocoding + One Call 3.0 "timemachine" client.
#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: ApiKey,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
    /// Every request made by this provider is bounded by `timeout`.
    pub fn new(base_url: &str, api_key: ApiKey, timeout: Duration) -> Result<Self, IngestError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { api_key, base_url: base_url.trim_end_matches('/').to_string(), http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let res = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .query(&[("appid", self.api_key.as_str())])
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;
        Ok((status, body))
    }
}

#[derive(Debug, Deserialize)]
struct OwGeoEntry {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct OwTimemachineResponse {
    data: Vec<OwHourly>,
}

#[derive(Debug, Deserialize)]
struct OwHourly {
    dt: i64,
    temp: Option<f64>,
    humidity: Option<f64>,
}

#[async_trait]
impl CoordinateResolver for OpenWeatherProvider {
    #[instrument(skip(self))]
    async fn resolve(&self, query: &str) -> Result<Coordinates, IngestError> {
        let resolution = |reason: String| IngestError::Resolution { query: query.to_string(), reason };

        let (status, body) = self
            .get(GEOCODING_PATH, &[("q", query.to_string()), ("limit", "1".to_string())])
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IngestError::Transport(describe(e))
                } else {
                    resolution(describe(e))
                }
            })?;

        if !status.is_success() {
            return Err(resolution(format!(
                "geocoding request failed with status {}: {}",
                status,
                truncate_body(&body),
            )));
        }

        let entries: Vec<OwGeoEntry> = serde_json::from_str(&body)
            .map_err(|e| resolution(format!("malformed geocoding response: {e}")))?;

        let first = entries.first().ok_or_else(|| resolution("no matching location".to_string()))?;
        debug!(lat = first.lat, lon = first.lon, "Resolved coordinates");

        Ok(Coordinates { lat: first.lat, lon: first.lon })
    }
}

#[async_trait]
impl HistoricalWeather for OpenWeatherProvider {
    #[instrument(skip(self, coordinates, hour), fields(lat = coordinates.lat, lon = coordinates.lon, hour = %hour))]
    async fn fetch(
        &self,
        coordinates: Coordinates,
        hour: DateTime<Utc>,
    ) -> Result<HourlyObservation, IngestError> {
        let (status, body) = self
            .get(
                TIMEMACHINE_PATH,
                &[
                    ("lat", coordinates.lat.to_string()),
                    ("lon", coordinates.lon.to_string()),
                    ("dt", hour.timestamp().to_string()),
                    ("units", "metric".to_string()),
                ],
            )
            .await
            .map_err(|e| IngestError::Transport(describe(e)))?;

        if !status.is_success() {
            return Err(IngestError::Upstream(format!(
                "historical request failed with status {}: {}",
                status,
                truncate_body(&body),
            )));
        }

        let parsed: OwTimemachineResponse = serde_json::from_str(&body)
            .map_err(|e| IngestError::Upstream(format!("malformed historical response: {e}")))?;

        debug!(points = parsed.data.len(), "Received historical data points");
        select_hour(&parsed.data, hour)
    }
}

/// Pick the data point whose UTC hour is exactly `hour`.
fn select_hour(points: &[OwHourly], hour: DateTime<Utc>) -> Result<HourlyObservation, IngestError> {
    let point = points
        .iter()
        .find(|p| DateTime::from_timestamp(p.dt, 0).map(truncate_to_hour) == Some(hour))
        .ok_or(IngestError::DataUnavailable { hour })?;

    let temperature_c = point
        .temp
        .ok_or_else(|| IngestError::Upstream(format!("data point {} has no temp", point.dt)))?;
    let humidity_pct = point
        .humidity
        .ok_or_else(|| IngestError::Upstream(format!("data point {} has no humidity", point.dt)))?;

    if !(0.0..=100.0).contains(&humidity_pct) {
        return Err(IngestError::Upstream(format!("humidity {humidity_pct} is outside 0..=100")));
    }

    Ok(HourlyObservation { temperature_c, humidity_pct })
}

/// Error text without the request URL, which carries the API key.
fn describe(err: reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {}", err.without_url())
    } else {
        err.without_url().to_string()
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
