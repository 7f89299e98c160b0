//! Hourly gap-fill orchestration.
//!
//! Each run looks at one hour only: the most recent complete one. A city
//! whose store already reaches that hour is skipped; otherwise its
//! coordinates are resolved, the hour is fetched and appended. Gaps longer
//! than an hour close one hour per run.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::{
    error::{IngestError, StoreError},
    model::{CityConfig, Coordinates, WeatherReading, last_complete_hour},
    provider::{CoordinateResolver, HistoricalWeather},
    store::TimeSeriesStore,
};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum CityOutcome {
    Appended(WeatherReading),
    /// The store already reaches the target hour.
    Skipped { latest: DateTime<Utc> },
    Failed(IngestError),
}

impl CityOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CityOutcome::Appended(_) => "appended",
            CityOutcome::Skipped { .. } => "skipped",
            CityOutcome::Failed(e) if e.is_benign() => "pending",
            CityOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct CityReport {
    pub city: String,
    pub outcome: CityOutcome,
}

#[derive(Debug)]
pub struct RunReport {
    pub target_hour: DateTime<Utc>,
    pub cities: Vec<CityReport>,
}

impl RunReport {
    pub fn outcome(&self, city: &str) -> Option<&CityOutcome> {
        self.cities.iter().find(|r| r.city == city).map(|r| &r.outcome)
    }

    fn count(&self, label: &str) -> usize {
        self.cities.iter().filter(|r| r.outcome.label() == label).count()
    }

    pub fn appended(&self) -> usize {
        self.count("appended")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    /// Cities whose hour is not available upstream yet.
    pub fn pending(&self) -> usize {
        self.count("pending")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }
}

#[derive(Debug)]
pub struct GapFillEngine {
    resolver: Arc<dyn CoordinateResolver>,
    weather: Arc<dyn HistoricalWeather>,
    store: Arc<dyn TimeSeriesStore>,
    store_timeout: Duration,
}

impl GapFillEngine {
    pub fn new(
        resolver: Arc<dyn CoordinateResolver>,
        weather: Arc<dyn HistoricalWeather>,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        Self { resolver, weather, store, store_timeout: DEFAULT_STORE_TIMEOUT }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Fill the last complete hour, relative to the wall clock, for every city.
    pub async fn run(&self, cities: &[CityConfig]) -> RunReport {
        self.run_at(cities, Utc::now()).await
    }

    /// Same as [`run`](Self::run) with an explicit invocation instant.
    pub async fn run_at(&self, cities: &[CityConfig], now: DateTime<Utc>) -> RunReport {
        let target_hour = last_complete_hour(now);
        info!(%target_hour, cities = cities.len(), "Starting gap-fill run");

        // Geocoding results live for this run only.
        let mut coordinates = HashMap::new();
        let mut report = RunReport { target_hour, cities: Vec::with_capacity(cities.len()) };

        for city in cities {
            let outcome = self
                .fill_city(city, target_hour, &mut coordinates)
                .await
                .unwrap_or_else(CityOutcome::Failed);

            log_outcome(&city.name, target_hour, &outcome);
            report.cities.push(CityReport { city: city.name.clone(), outcome });
        }

        info!(
            appended = report.appended(),
            skipped = report.skipped(),
            pending = report.pending(),
            failed = report.failed(),
            "Gap-fill run finished"
        );
        report
    }

    async fn fill_city(
        &self,
        city: &CityConfig,
        target_hour: DateTime<Utc>,
        cache: &mut HashMap<String, Coordinates>,
    ) -> Result<CityOutcome, IngestError> {
        let latest = self
            .bounded("reading latest timestamp", self.store.latest_timestamp(city))
            .await?;

        if let Some(latest) = latest.filter(|latest| *latest >= target_hour) {
            return Ok(CityOutcome::Skipped { latest });
        }

        let coordinates = self.coordinates_for(city, cache).await?;
        let observation = self.weather.fetch(coordinates, target_hour).await?;
        let reading = WeatherReading::from_observation(&city.name, target_hour, observation);

        self.bounded("appending reading", self.store.append(city, &reading)).await?;
        Ok(CityOutcome::Appended(reading))
    }

    async fn coordinates_for(
        &self,
        city: &CityConfig,
        cache: &mut HashMap<String, Coordinates>,
    ) -> Result<Coordinates, IngestError> {
        if let Some(fixed) = city.coordinates {
            return Ok(fixed);
        }

        let query = city.geocoding_query();
        if let Some(cached) = cache.get(query) {
            return Ok(*cached);
        }

        let resolved = self.resolver.resolve(query).await?;
        cache.insert(query.to_string(), resolved);
        Ok(resolved)
    }

    async fn bounded<T>(
        &self,
        what: &str,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, IngestError> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(IngestError::Transport(format!(
                "store timed out after {:?} while {what}",
                self.store_timeout
            ))),
        }
    }
}

fn log_outcome(city: &str, target_hour: DateTime<Utc>, outcome: &CityOutcome) {
    match outcome {
        CityOutcome::Appended(r) => info!(
            city,
            %target_hour,
            temperature_c = r.temperature_c,
            humidity_pct = r.humidity_pct,
            "Appended reading"
        ),
        CityOutcome::Skipped { latest } => info!(city, %latest, "Already up to date"),
        CityOutcome::Failed(e) if e.is_benign() => info!(city, %target_hour, "Not yet ready: {e}"),
        CityOutcome::Failed(e @ IngestError::Store(_)) => error!(city, "Store failure: {e}"),
        CityOutcome::Failed(e) => warn!(city, "Failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::HourlyObservation, store::CsvStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn coords(lat: f64) -> Coordinates {
        Coordinates { lat, lon: 30.0 }
    }

    #[derive(Debug, Default)]
    struct FakeResolver {
        known: HashMap<String, Coordinates>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn with(entries: &[(&str, Coordinates)]) -> Self {
            let known = entries.iter().map(|(q, c)| (q.to_string(), *c)).collect();
            Self { known, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl CoordinateResolver for FakeResolver {
        async fn resolve(&self, query: &str) -> Result<Coordinates, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.known.get(query).copied().ok_or_else(|| IngestError::Resolution {
                query: query.to_string(),
                reason: "no matching location".into(),
            })
        }
    }

    #[derive(Debug)]
    struct FakeWeather {
        observation: HourlyObservation,
        failing_lat: Option<f64>,
        unavailable: bool,
        requested: Mutex<Vec<DateTime<Utc>>>,
    }

    impl FakeWeather {
        fn returning(temperature_c: f64, humidity_pct: f64) -> Self {
            Self {
                observation: HourlyObservation { temperature_c, humidity_pct },
                failing_lat: None,
                unavailable: false,
                requested: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requested.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HistoricalWeather for FakeWeather {
        async fn fetch(
            &self,
            coordinates: Coordinates,
            hour: DateTime<Utc>,
        ) -> Result<HourlyObservation, IngestError> {
            self.requested.lock().unwrap().push(hour);
            if self.failing_lat == Some(coordinates.lat) {
                return Err(IngestError::Transport("connection reset".into()));
            }
            if self.unavailable {
                return Err(IngestError::DataUnavailable { hour });
            }
            Ok(self.observation)
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<CsvStore>,
        resolver: Arc<FakeResolver>,
        weather: Arc<FakeWeather>,
        engine: GapFillEngine,
    }

    fn harness(resolver: FakeResolver, weather: FakeWeather) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CsvStore::new(dir.path()));
        let resolver = Arc::new(resolver);
        let weather = Arc::new(weather);
        let engine = GapFillEngine::new(resolver.clone(), weather.clone(), store.clone());
        Harness { _dir: dir, store, resolver, weather, engine }
    }

    fn kampala() -> CityConfig {
        CityConfig::new("Kampala").with_query("Kampala,UG")
    }

    fn three_cities() -> (Vec<CityConfig>, FakeResolver) {
        let cities = vec![
            CityConfig::new("Cape Town").with_query("Cape Town,ZA"),
            CityConfig::new("Kigali").with_query("Kigali,RW"),
            kampala(),
        ];
        let resolver = FakeResolver::with(&[
            ("Cape Town,ZA", coords(-33.9)),
            ("Kigali,RW", coords(-1.9)),
            ("Kampala,UG", coords(0.3)),
        ]);
        (cities, resolver)
    }

    async fn seed(store: &CsvStore, city: &CityConfig, timestamp: DateTime<Utc>) {
        let reading = WeatherReading {
            city: city.name.clone(),
            timestamp,
            temperature_c: 20.0,
            humidity_pct: 60.0,
        };
        store.append(city, &reading).await.unwrap();
    }

    #[tokio::test]
    async fn kampala_example_appends_previous_hour() {
        let h = harness(
            FakeResolver::with(&[("Kampala,UG", coords(0.3))]),
            FakeWeather::returning(21.4, 63.0),
        );
        seed(&h.store, &kampala(), at(10, 0)).await;

        let report = h.engine.run_at(&[kampala()], at(12, 10)).await;

        assert_eq!(report.target_hour, at(11, 0));
        assert!(matches!(report.outcome("Kampala"), Some(CityOutcome::Appended(_))));

        let all = h.store.read_all(&kampala()).await.unwrap();
        let last = all.last().unwrap();
        assert_eq!(last.timestamp, at(11, 0));
        assert_eq!(last.temperature_c, 21.4);
        assert_eq!(last.humidity_pct, 63.0);
    }

    #[tokio::test]
    async fn up_to_date_city_is_skipped_without_fetching() {
        let h = harness(
            FakeResolver::with(&[("Kampala,UG", coords(0.3))]),
            FakeWeather::returning(21.4, 63.0),
        );
        seed(&h.store, &kampala(), at(11, 0)).await;

        let report = h.engine.run_at(&[kampala()], at(12, 10)).await;

        assert!(
            matches!(report.outcome("Kampala"), Some(CityOutcome::Skipped { latest }) if *latest == at(11, 0))
        );
        assert_eq!(h.weather.calls(), 0);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn latest_in_the_future_is_skipped() {
        let h = harness(FakeResolver::default(), FakeWeather::returning(21.4, 63.0));
        seed(&h.store, &kampala(), at(15, 0)).await;

        let report = h.engine.run_at(&[kampala()], at(12, 10)).await;

        assert_eq!(report.skipped(), 1);
        assert_eq!(h.store.read_all(&kampala()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_run_in_same_hour_is_a_no_op() {
        let (cities, resolver) = three_cities();
        let h = harness(resolver, FakeWeather::returning(18.0, 55.0));

        let first = h.engine.run_at(&cities, at(12, 10)).await;
        assert_eq!(first.appended(), 3);

        let second = h.engine.run_at(&cities, at(12, 40)).await;
        assert_eq!(second.skipped(), 3);
        assert_eq!(second.appended(), 0);
        assert_eq!(h.weather.calls(), 3);

        for city in &cities {
            assert_eq!(h.store.read_all(city).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn large_gap_closes_one_hour_per_run() {
        let h = harness(
            FakeResolver::with(&[("Kampala,UG", coords(0.3))]),
            FakeWeather::returning(21.4, 63.0),
        );
        seed(&h.store, &kampala(), at(5, 0)).await;

        h.engine.run_at(&[kampala()], at(12, 10)).await;

        let all = h.store.read_all(&kampala()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(h.store.latest_timestamp(&kampala()).await.unwrap(), Some(at(11, 0)));
        assert_eq!(*h.weather.requested.lock().unwrap(), vec![at(11, 0)]);
    }

    #[tokio::test]
    async fn one_failing_city_does_not_block_the_others() {
        let (cities, resolver) = three_cities();
        let mut weather = FakeWeather::returning(18.0, 55.0);
        weather.failing_lat = Some(-1.9);
        let h = harness(resolver, weather);

        let report = h.engine.run_at(&cities, at(12, 10)).await;

        assert!(matches!(report.outcome("Cape Town"), Some(CityOutcome::Appended(_))));
        assert!(matches!(
            report.outcome("Kigali"),
            Some(CityOutcome::Failed(IngestError::Transport(_)))
        ));
        assert!(matches!(report.outcome("Kampala"), Some(CityOutcome::Appended(_))));
        assert_eq!(report.failed(), 1);
        assert!(h.store.read_all(&cities[1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_failure_is_recorded_per_city() {
        let (mut cities, resolver) = three_cities();
        cities.insert(1, CityConfig::new("Atlantis"));
        let h = harness(resolver, FakeWeather::returning(18.0, 55.0));

        let report = h.engine.run_at(&cities, at(12, 10)).await;

        assert!(matches!(
            report.outcome("Atlantis"),
            Some(CityOutcome::Failed(IngestError::Resolution { .. }))
        ));
        assert_eq!(report.appended(), 3);
    }

    #[tokio::test]
    async fn unavailable_hour_is_pending_not_failed() {
        let mut weather = FakeWeather::returning(18.0, 55.0);
        weather.unavailable = true;
        let h = harness(FakeResolver::with(&[("Kampala,UG", coords(0.3))]), weather);

        let report = h.engine.run_at(&[kampala()], at(12, 10)).await;

        assert_eq!(report.pending(), 1);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.outcome("Kampala").map(CityOutcome::label), Some("pending"));
        assert!(h.store.read_all(&kampala()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn geocoding_is_cached_within_a_run() {
        let cities = vec![
            CityConfig::new("Kampala").with_query("Kampala,UG"),
            CityConfig::new("Kampala Central").with_query("Kampala,UG"),
        ];
        let h = harness(
            FakeResolver::with(&[("Kampala,UG", coords(0.3))]),
            FakeWeather::returning(21.4, 63.0),
        );

        let report = h.engine.run_at(&cities, at(12, 10)).await;

        assert_eq!(report.appended(), 2);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fixed_coordinates_skip_geocoding() {
        let city = CityConfig::new("Kigali").with_coordinates(-1.95, 30.06);
        let h = harness(FakeResolver::default(), FakeWeather::returning(19.0, 70.0));

        let report = h.engine.run_at(&[city], at(12, 10)).await;

        assert_eq!(report.appended(), 1);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_writer_hits_duplicate_guard() {
        let h = harness(
            FakeResolver::with(&[("Kampala,UG", coords(0.3))]),
            FakeWeather::returning(21.4, 63.0),
        );
        // Prime the tail cache with "empty", then let another run write the hour.
        assert_eq!(h.store.latest_timestamp(&kampala()).await.unwrap(), None);
        let other = CsvStore::new(h.store.data_dir());
        seed(&other, &kampala(), at(11, 0)).await;

        let report = h.engine.run_at(&[kampala()], at(12, 10)).await;

        assert!(matches!(
            report.outcome("Kampala"),
            Some(CityOutcome::Failed(IngestError::Store(StoreError::DuplicateTimestamp { .. })))
        ));
        assert_eq!(h.store.read_all(&kampala()).await.unwrap().len(), 1);
    }

    #[derive(Debug)]
    struct HangingStore;

    #[async_trait]
    impl TimeSeriesStore for HangingStore {
        async fn latest_timestamp(
            &self,
            _city: &CityConfig,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            std::future::pending().await
        }

        async fn append(&self, _city: &CityConfig, _reading: &WeatherReading) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn read_all(&self, _city: &CityConfig) -> Result<Vec<WeatherReading>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn store_timeout_is_a_transport_error() {
        let engine = GapFillEngine::new(
            Arc::new(FakeResolver::default()),
            Arc::new(FakeWeather::returning(1.0, 1.0)),
            Arc::new(HangingStore),
        )
        .with_store_timeout(Duration::from_millis(20));

        let report = engine.run_at(&[kampala()], at(12, 10)).await;

        assert!(matches!(
            report.outcome("Kampala"),
            Some(CityOutcome::Failed(IngestError::Transport(msg))) if msg.contains("timed out")
        ));
    }
}
