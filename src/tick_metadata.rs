use crate::broker_registry::normalize_identity;
use crate::error::PipelineError;
use crate::error_sink::{ErrorRecord, ErrorSink};
use crate::storage_utils::AsyncStorageManager;
use crate::terminal::SymbolInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMetadata {
    pub symbol: String,
    pub broker: String,
    pub tick_size: f64,
    pub tick_value: f64,
}

impl TickMetadata {
    pub fn new(symbol: &str, broker_identity: &str, info: SymbolInfo) -> Self {
        Self {
            symbol: symbol.to_string(),
            broker: normalize_identity(broker_identity),
            tick_size: info.tick_size,
            tick_value: info.tick_value,
        }
    }
}

/// Process-wide symbol -> [`TickMetadata`] mapping, persisted as one file.
///
/// The mapping survives across runs and is only rewritten when an entry actually changes.
/// All read-modify-write cycles go through one lock, so concurrent broker workers never
/// interleave partial updates.
#[derive(Clone)]
pub struct TickMetadataRegistry {
    storage: AsyncStorageManager,
    filename: String,
    entries: Arc<Mutex<BTreeMap<String, TickMetadata>>>,
}

impl TickMetadataRegistry {
    /// Loads the existing mapping, starting empty when the file does not exist yet.
    pub async fn open(
        storage: AsyncStorageManager,
        filename: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let filename = filename.into();
        let entries = storage
            .load_optional::<BTreeMap<String, TickMetadata>>(&filename)
            .await
            .map_err(PipelineError::io)?
            .unwrap_or_default();

        Ok(Self {
            storage,
            filename,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    /// Like [`open`](Self::open), but an unreadable mapping is recorded in `sink` and the run
    /// starts from an empty one. The next changed entry rewrites the file.
    pub async fn open_or_empty(
        storage: AsyncStorageManager,
        filename: impl Into<String>,
        sink: &ErrorSink,
    ) -> Self {
        let filename = filename.into();
        match Self::open(storage.clone(), filename.as_str()).await {
            Ok(registry) => registry,
            Err(e) => {
                sink.record(ErrorRecord::new("-", &e)).await;
                Self {
                    storage,
                    filename,
                    entries: Arc::new(Mutex::new(BTreeMap::new())),
                }
            }
        }
    }

    /// Stores `record` under its symbol. Returns `false`, without touching the file, when the
    /// stored entry is already field-for-field equal.
    pub async fn merge(&self, record: TickMetadata) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock().await;
        if entries.get(&record.symbol) == Some(&record) {
            debug!(symbol = %record.symbol, "tick metadata unchanged");
            return Ok(false);
        }

        let previous = entries.insert(record.symbol.clone(), record.clone());
        if let Err(e) = self.storage.save(&self.filename, &*entries).await {
            // Keep memory in line with disk so the next merge retries the write.
            match previous {
                Some(prev) => entries.insert(record.symbol.clone(), prev),
                None => entries.remove(&record.symbol),
            };
            return Err(PipelineError::io(e));
        }
        Ok(true)
    }

    #[cfg(test)]
    pub async fn get(&self, symbol: &str) -> Option<TickMetadata> {
        self.entries.lock().await.get(symbol).cloned()
    }
}
