use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Per-city failure raised while filling a gap.
///
/// The engine records these in the run report; none of them stops the
/// remaining cities from being processed.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Geocoding returned nothing usable for the city.
    #[error("could not resolve coordinates for '{query}': {reason}")]
    Resolution { query: String, reason: String },

    /// Network failure or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success status or a payload we could not make sense of.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The provider has not ingested the requested hour yet.
    #[error("no data for {hour} available upstream yet")]
    DataUnavailable { hour: DateTime<Utc> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Expected conditions that clear up on a later run by themselves.
    pub fn is_benign(&self) -> bool {
        matches!(self, IngestError::DataUnavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{city} already has a reading for {timestamp}")]
    DuplicateTimestamp { city: String, timestamp: DateTime<Utc> },

    #[error("{city}: reading for {timestamp} is older than the latest stored {latest}")]
    OutOfOrder { city: String, timestamp: DateTime<Utc>, latest: DateTime<Utc> },

    #[error("{}:{line}: {reason}", path.display())]
    Corrupt { path: PathBuf, line: usize, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn only_data_unavailable_is_benign() {
        let hour = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        assert!(IngestError::DataUnavailable { hour }.is_benign());
        assert!(!IngestError::Transport("timed out".into()).is_benign());
        assert!(
            !IngestError::from(StoreError::DuplicateTimestamp { city: "Kigali".into(), timestamp: hour })
                .is_benign()
        );
    }

    #[test]
    fn resolution_message_names_query() {
        let err = IngestError::Resolution { query: "Atlantis,XX".into(), reason: "no match".into() };
        assert_eq!(err.to_string(), "could not resolve coordinates for 'Atlantis,XX': no match");
    }
}
