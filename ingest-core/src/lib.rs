//! Core library for the hourly weather ingester.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Coordinate resolution and historical weather retrieval (OpenWeather)
//! - The append-only per-city CSV time-series store
//! - The gap-fill engine that ties them together
//!
//! It is used by `ingest-cli`, but can also be driven by other binaries or schedulers.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod provider;
pub mod store;

pub use config::{ApiKey, Config, OpenWeatherConfig};
pub use engine::{CityOutcome, CityReport, GapFillEngine, RunReport};
pub use error::{IngestError, StoreError};
pub use model::{CityConfig, Coordinates, HourlyObservation, WeatherReading, last_complete_hour};
pub use provider::{CoordinateResolver, HistoricalWeather, openweather::OpenWeatherProvider};
pub use store::{CsvStore, TimeSeriesStore};
