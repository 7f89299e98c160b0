use crate::{
    Config,
    config::ApiKey,
    error::IngestError,
    model::{Coordinates, HourlyObservation},
    provider::openweather::OpenWeatherProvider,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

pub mod openweather;

/// Maps a city query to coordinates.
#[async_trait]
pub trait CoordinateResolver: Send + Sync + Debug {
    async fn resolve(&self, query: &str) -> Result<Coordinates, IngestError>;
}

/// Point-in-time historical weather for one hour at one location.
#[async_trait]
pub trait HistoricalWeather: Send + Sync + Debug {
    async fn fetch(
        &self,
        coordinates: Coordinates,
        hour: DateTime<Utc>,
    ) -> Result<HourlyObservation, IngestError>;
}

/// Construct the OpenWeather provider from config and an already-resolved key.
pub fn provider_from_config(
    config: &Config,
    api_key: ApiKey,
) -> Result<OpenWeatherProvider, IngestError> {
    OpenWeatherProvider::new(&config.openweather.base_url, api_key, config.request_timeout())
}
