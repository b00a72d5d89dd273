use crate::candle::Timeframe;
use crate::error::PipelineError;
use crate::storage_utils::AsyncStorageManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub broker: String,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub requested_bars: Option<usize>,
    pub available_bars: Option<usize>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(broker: impl Into<String>, err: &PipelineError) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: err.kind().to_string(),
            broker: broker.into(),
            symbol: None,
            timeframe: None,
            requested_bars: None,
            available_bars: None,
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    #[must_use]
    pub fn bars(mut self, requested: usize, available: Option<usize>) -> Self {
        self.requested_bars = Some(requested);
        self.available_bars = available;
        self
    }
}

/// Run-scoped error log.
///
/// Every [`record`](Self::record) appends and then rewrites the whole log file, so the file
/// always holds the full list for the current run. Clones share the same list; appends from
/// concurrent broker workers are serialized by the inner lock.
#[derive(Clone)]
pub struct ErrorSink {
    records: Arc<Mutex<Vec<ErrorRecord>>>,
    storage: AsyncStorageManager,
    filename: String,
}

impl ErrorSink {
    pub fn new(storage: AsyncStorageManager, filename: impl Into<String>) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            storage,
            filename: filename.into(),
        }
    }

    pub async fn record(&self, record: ErrorRecord) {
        warn!(
            kind = %record.kind,
            broker = %record.broker,
            symbol = record.symbol.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );

        // Held across the write so flushes land in append order.
        let mut records = self.records.lock().await;
        records.push(record);
        if let Err(e) = self.storage.save(&self.filename, &*records).await {
            error!(error = %format!("{e:#}"), "failed to flush error log");
        }
    }

    #[cfg(test)]
    pub async fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
