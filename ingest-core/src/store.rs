//! Append-only per-city CSV time series.
//!
//! Each city owns one file in the data directory:
//!
//! ```text
//! timestamp,temperature,humidity
//! 2024-05-01T10:00:00+00:00,20.1,66.0
//! 2024-05-01T11:00:00+00:00,21.4,63.0
//! ```
//!
//! Rows are strictly ascending by timestamp and are only ever added at the
//! end, so a concurrent reader always sees a valid prefix. Every row is
//! written with its newline, so a trailing row without one is an
//! interrupted write even if it happens to parse: it is ignored when reading
//! and cut off by the next append.

use std::{
    collections::HashMap,
    fmt::Debug,
    io::SeekFrom,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, error};

use crate::{
    error::StoreError,
    model::{CityConfig, WeatherReading},
};

pub const HEADER: [&str; 3] = ["timestamp", "temperature", "humidity"];

#[async_trait]
pub trait TimeSeriesStore: Send + Sync + Debug {
    /// Timestamp of the newest stored reading, `None` for an empty series.
    async fn latest_timestamp(&self, city: &CityConfig) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Durably append one reading after all existing ones.
    ///
    /// Fails with [`StoreError::DuplicateTimestamp`] if the hour is already
    /// stored and [`StoreError::OutOfOrder`] if it predates the newest row.
    /// On failure the series is left as it was.
    async fn append(&self, city: &CityConfig, reading: &WeatherReading) -> Result<(), StoreError>;

    async fn read_all(&self, city: &CityConfig) -> Result<Vec<WeatherReading>, StoreError>;
}

#[derive(Debug)]
pub struct CsvStore {
    data_dir: PathBuf,
    /// Newest timestamp per file, filled on first access and on every append.
    tails: Mutex<HashMap<PathBuf, Option<DateTime<Utc>>>>,
}

impl CsvStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), tails: Mutex::new(HashMap::new()) }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, city: &CityConfig) -> PathBuf {
        self.data_dir.join(city.file_name())
    }

    async fn load(&self, city: &str, path: &Path) -> Result<Snapshot, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => parse(city, path, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

#[async_trait]
impl TimeSeriesStore for CsvStore {
    async fn latest_timestamp(&self, city: &CityConfig) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.path_for(city);
        let mut tails = self.tails.lock().await;

        if let Some(latest) = tails.get(&path) {
            return Ok(*latest);
        }

        let latest = self.load(&city.name, &path).await?.latest();
        tails.insert(path, latest);
        Ok(latest)
    }

    async fn append(&self, city: &CityConfig, reading: &WeatherReading) -> Result<(), StoreError> {
        let path = self.path_for(city);
        let mut tails = self.tails.lock().await;

        // The file on disk is authoritative here, not the cached tail.
        let snapshot = self.load(&city.name, &path).await?;

        if snapshot.readings.iter().any(|r| r.timestamp == reading.timestamp) {
            return Err(StoreError::DuplicateTimestamp {
                city: city.name.clone(),
                timestamp: reading.timestamp,
            });
        }
        if let Some(latest) = snapshot.latest().filter(|latest| reading.timestamp < *latest) {
            return Err(StoreError::OutOfOrder {
                city: city.name.clone(),
                timestamp: reading.timestamp,
                latest,
            });
        }

        let mut buf = Vec::new();
        if snapshot.needs_newline {
            buf.push(b'\n');
        }
        encode(reading, !snapshot.has_header, &mut buf).map_err(|e| StoreError::io(&path, e))?;

        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StoreError::io(&self.data_dir, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        if let Err(e) = write_at(&mut file, snapshot.valid_len, &buf).await {
            // Roll back to the last complete row so readers never see a partial one.
            if let Err(rollback_err) = truncate_to(&mut file, snapshot.valid_len).await {
                error!(
                    path = %path.display(),
                    valid_len = snapshot.valid_len,
                    error = %rollback_err,
                    "Failed to roll back partial append"
                );
            }
            return Err(StoreError::io(&path, e));
        }

        debug!(path = %path.display(), timestamp = %reading.timestamp, "Appended reading");
        tails.insert(path, Some(reading.timestamp));
        Ok(())
    }

    async fn read_all(&self, city: &CityConfig) -> Result<Vec<WeatherReading>, StoreError> {
        let path = self.path_for(city);
        Ok(self.load(&city.name, &path).await?.readings)
    }
}

async fn write_at(file: &mut fs::File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn truncate_to(file: &mut fs::File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.sync_all().await
}

/// Parsed view of a store file.
#[derive(Debug, Default)]
struct Snapshot {
    readings: Vec<WeatherReading>,
    /// Byte length of the valid prefix; anything after it is a torn write.
    valid_len: u64,
    has_header: bool,
    /// The header line has no terminating newline.
    needs_newline: bool,
}

impl Snapshot {
    fn latest(&self) -> Option<DateTime<Utc>> {
        self.readings.last().map(|r| r.timestamp)
    }
}

fn parse(city: &str, path: &Path, bytes: &[u8]) -> Result<Snapshot, StoreError> {
    let corrupt = |line: usize, reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let text = std::str::from_utf8(bytes).map_err(|e| corrupt(0, format!("not UTF-8: {e}")))?;
    let mut snapshot = Snapshot::default();
    let mut offset = 0usize;

    for (idx, raw) in text.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let terminated = raw.ends_with('\n');
        let line = raw.trim_end_matches(['\n', '\r']);

        if line.trim().is_empty() {
            offset += raw.len();
            continue;
        }

        if !snapshot.has_header {
            if is_header(line) {
                snapshot.has_header = true;
            } else if !terminated {
                break;
            } else {
                return Err(corrupt(line_no, "missing header".to_string()));
            }
        } else if !terminated {
            // A row without its newline was cut short, whatever it parses to.
            break;
        } else {
            match parse_row(line) {
                Ok((timestamp, temperature_c, humidity_pct)) => {
                    if let Some(latest) = snapshot.latest().filter(|latest| timestamp <= *latest) {
                        return Err(corrupt(
                            line_no,
                            format!("{timestamp} does not follow {latest}"),
                        ));
                    }
                    snapshot.readings.push(WeatherReading {
                        city: city.to_string(),
                        timestamp,
                        temperature_c,
                        humidity_pct,
                    });
                }
                Err(reason) => return Err(corrupt(line_no, reason)),
            }
        }

        offset += raw.len();
        snapshot.needs_newline = !terminated;
    }

    snapshot.valid_len = offset as u64;
    Ok(snapshot)
}

fn is_header(line: &str) -> bool {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    fields == HEADER
}

fn parse_row(line: &str) -> Result<(DateTime<Utc>, f64, f64), String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());

    let (timestamp, temperature, humidity): (String, f64, f64) = reader
        .deserialize()
        .next()
        .ok_or_else(|| "empty row".to_string())?
        .map_err(|e| format!("invalid row: {e}"))?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| format!("invalid timestamp '{timestamp}': {e}"))?
        .with_timezone(&Utc);

    Ok((timestamp, temperature, humidity))
}

fn encode(reading: &WeatherReading, with_header: bool, out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    if with_header {
        writer.write_record(HEADER)?;
    }
    writer.serialize((
        format_timestamp(reading.timestamp),
        reading.temperature_c,
        reading.humidity_pct,
    ))?;

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    out.extend_from_slice(&bytes);
    Ok(())
}

/// RFC 3339 with an explicit `+00:00` offset, e.g. `2024-05-01T11:00:00+00:00`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
}
