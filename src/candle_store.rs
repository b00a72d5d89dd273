//! Layered JSON persistence for one broker's candle data.
//!
//! Layout under a broker's base folder:
//!
//! ```text
//! <symbol>/<timeframe>/candles.json               full snapshot
//! <symbol>/<timeframe>/candles_<S>.json           last S candles, per slice size
//! <symbol>/<timeframe>/latest_completed.json      second-to-last candle of the snapshot
//! <symbol>/<timeframe>/latest_completed_<S>.json  same, per slice (distinct naming only)
//! <symbol>/<timeframe>/extrema.json               parent highs/lows
//! <symbol>/tick_metadata.json
//! ```
//!
//! Files are written one by one with no cross-file transaction: a crash part-way leaves the
//! earlier files of the run next to stale later ones until the next run rewrites them.

use crate::candle::{Candle, CandleSnapshot, Timeframe};
use crate::config::LatestCandleNaming;
use crate::error::PipelineError;
use crate::extrema::ExtremaLabels;
use crate::storage_utils::AsyncStorageManager;
use crate::tick_metadata::TickMetadata;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshots shorter than this are not persisted at all.
pub const MIN_SNAPSHOT_LEN: usize = 2;
/// Snapshots shorter than this are never sliced.
pub const MIN_SLICING_LEN: usize = 11;

/// Second-to-last candle of a snapshot or slice, without its `candle_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestCompletedCandle {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// `full` or `slice_<S>`.
    pub source: String,
    #[serde(flatten)]
    pub candle: Candle,
    pub age: String,
}

/// What one [`CandleStore::write_snapshot`] call persisted.
#[derive(Debug, Default)]
pub struct SnapshotReport {
    pub full_written: bool,
    pub latest_written: bool,
    pub slices_written: Vec<usize>,
    pub slices_skipped: Vec<usize>,
    /// Non-fatal failures of individual steps; siblings already written stay in place.
    pub issues: Vec<PipelineError>,
}

/// `"{H}h old"` up to and including 24 hours, `"{D}d old"` beyond. Truncates; future
/// timestamps count as zero.
pub fn age_label(candle_time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = (now - candle_time).max(Duration::zero());
    if age <= Duration::hours(24) {
        format!("{}h old", age.num_hours())
    } else {
        format!("{}d old", age.num_days())
    }
}

/// Turns a symbol into a single path segment.
pub fn path_segment(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CandleStore {
    slice_sizes: Vec<usize>,
    naming: LatestCandleNaming,
}

impl CandleStore {
    pub fn new(slice_sizes: Vec<usize>, naming: LatestCandleNaming) -> Self {
        Self {
            slice_sizes,
            naming,
        }
    }

    fn dir(symbol: &str, timeframe: Timeframe) -> String {
        format!("{}/{}", path_segment(symbol), timeframe)
    }

    fn latest_name(&self, slice: Option<usize>) -> String {
        match (self.naming, slice) {
            (LatestCandleNaming::Distinct, Some(size)) => format!("latest_completed_{size}"),
            _ => "latest_completed".to_string(),
        }
    }

    /// Writes the full snapshot, its latest-completed candle, then every slice the snapshot
    /// is long enough for.
    ///
    /// Fails with [`PipelineError::Validation`] and writes nothing when the snapshot has fewer
    /// than [`MIN_SNAPSHOT_LEN`] candles.
    pub async fn write_snapshot(
        &self,
        storage: &AsyncStorageManager,
        snapshot: &CandleSnapshot,
        now: DateTime<Utc>,
    ) -> Result<SnapshotReport, PipelineError> {
        if snapshot.len() < MIN_SNAPSHOT_LEN {
            return Err(PipelineError::Validation(format!(
                "{} {}: {} candle(s), need at least {MIN_SNAPSHOT_LEN}",
                snapshot.symbol,
                snapshot.timeframe,
                snapshot.len()
            )));
        }

        let dir = Self::dir(&snapshot.symbol, snapshot.timeframe);
        let mut report = SnapshotReport::default();

        match storage.save(&format!("{dir}/candles"), snapshot).await {
            Ok(()) => report.full_written = true,
            Err(e) => report.issues.push(PipelineError::io(e)),
        }

        match self.write_latest(storage, &dir, snapshot, None, now).await {
            Ok(()) => report.latest_written = true,
            Err(e) => report.issues.push(e),
        }

        if snapshot.len() < MIN_SLICING_LEN {
            report.issues.push(PipelineError::Validation(format!(
                "{} {}: {} candles, slicing needs at least {MIN_SLICING_LEN}",
                snapshot.symbol,
                snapshot.timeframe,
                snapshot.len()
            )));
            report.slices_skipped = self.slice_sizes.clone();
            return Ok(report);
        }

        for &size in &self.slice_sizes {
            let Some(slice) = snapshot.tail(size) else {
                debug!(
                    symbol = %snapshot.symbol,
                    timeframe = %snapshot.timeframe,
                    size,
                    available = snapshot.len(),
                    "snapshot too short for slice"
                );
                report.slices_skipped.push(size);
                continue;
            };

            if let Err(e) = storage.save(&format!("{dir}/candles_{size}"), &slice).await {
                report.issues.push(PipelineError::io(e));
                continue;
            }
            if let Err(e) = self.write_latest(storage, &dir, &slice, Some(size), now).await {
                report.issues.push(e);
            }
            report.slices_written.push(size);
        }

        info!(
            symbol = %snapshot.symbol,
            timeframe = %snapshot.timeframe,
            candles = snapshot.len(),
            slices = ?report.slices_written,
            "snapshot persisted"
        );
        Ok(report)
    }

    async fn write_latest(
        &self,
        storage: &AsyncStorageManager,
        dir: &str,
        snapshot: &CandleSnapshot,
        slice: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let candle = snapshot.latest_completed().ok_or_else(|| {
            PipelineError::Validation(format!(
                "{} {}: no completed candle",
                snapshot.symbol, snapshot.timeframe
            ))
        })?;

        let record = LatestCompletedCandle {
            id: Uuid::new_v4().to_string(),
            symbol: snapshot.symbol.clone(),
            timeframe: snapshot.timeframe,
            source: slice.map_or_else(|| "full".to_string(), |s| format!("slice_{s}")),
            candle: candle.clone(),
            age: age_label(candle.time, now),
        };

        storage
            .save(&format!("{dir}/{}", self.latest_name(slice)), &record)
            .await
            .map_err(PipelineError::io)
    }

    pub async fn write_extrema(
        &self,
        storage: &AsyncStorageManager,
        symbol: &str,
        timeframe: Timeframe,
        labels: &ExtremaLabels,
    ) -> Result<(), PipelineError> {
        let dir = Self::dir(symbol, timeframe);
        storage
            .save(&format!("{dir}/extrema"), labels)
            .await
            .map_err(PipelineError::io)
    }

    /// Per-symbol tick metadata; always rewritten.
    pub async fn write_tick_metadata(
        &self,
        storage: &AsyncStorageManager,
        record: &TickMetadata,
    ) -> Result<(), PipelineError> {
        storage
            .save(
                &format!("{}/tick_metadata", path_segment(&record.symbol)),
                record,
            )
            .await
            .map_err(PipelineError::io)
    }
}
