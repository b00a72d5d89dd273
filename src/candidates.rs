use crate::broker_registry::BrokerRegistry;
use crate::config::SymbolCatalog;
use crate::error::PipelineError;
use crate::error_sink::{ErrorRecord, ErrorSink};
use crate::session::SessionGate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::info;

/// One unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateTask {
    /// Normalized broker identity.
    pub broker: String,
    pub category: String,
    pub symbol: String,
}

/// category -> broker -> symbols, catalog order preserved. Empty queues are never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateQueues {
    queues: BTreeMap<String, BTreeMap<String, VecDeque<String>>>,
}

impl CandidateQueues {
    /// Adds a queue; empty ones are dropped.
    pub fn insert(&mut self, category: &str, broker: &str, symbols: Vec<String>) {
        if symbols.is_empty() {
            return;
        }
        self.queues
            .entry(category.to_string())
            .or_default()
            .insert(broker.to_string(), symbols.into());
    }

    pub fn total(&self) -> usize {
        self.queues
            .values()
            .flat_map(|brokers| brokers.values())
            .map(VecDeque::len)
            .sum()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[cfg(test)]
    pub fn queue(&self, category: &str, broker: &str) -> Option<&VecDeque<String>> {
        self.queues.get(category)?.get(broker)
    }

    pub(crate) fn into_inner(self) -> BTreeMap<String, BTreeMap<String, VecDeque<String>>> {
        self.queues
    }
}

/// Catalog symbols (in catalog order) that the broker's terminal actually offers.
pub fn intersect(catalog_symbols: &[String], available: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    catalog_symbols
        .iter()
        .filter(|s| available.contains(*s) && seen.insert(s.as_str()))
        .cloned()
        .collect()
}

/// Lists each representative's symbols once and intersects them with every catalog category.
///
/// Brokers whose session or listing fails are logged and left out of the queues.
pub async fn build_candidate_queues(
    registry: &BrokerRegistry,
    catalog: &SymbolCatalog,
    gate: &mut SessionGate,
    sink: &ErrorSink,
) -> CandidateQueues {
    let mut queues = CandidateQueues::default();

    for broker in registry.representatives() {
        let listed = match gate.acquire(&broker.identity, &broker.settings).await {
            Ok(terminal) => terminal
                .list_symbols()
                .await
                .map_err(|e| PipelineError::Connection(format!("{}: {e}", broker.identity))),
            Err(e) => Err(e),
        };
        gate.release().await;

        let available: HashSet<String> = match listed {
            Ok(symbols) => symbols.into_iter().collect(),
            Err(e) => {
                sink.record(ErrorRecord::new(broker.normalized.as_str(), &e))
                    .await;
                continue;
            }
        };

        for (category, symbols) in catalog {
            let matched = intersect(symbols, &available);
            info!(
                broker = %broker.normalized,
                category = %category,
                matched = matched.len(),
                "candidate queue built"
            );
            queues.insert(category, &broker.normalized, matched);
        }
    }

    queues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerSettings, BrokerStore};
    use crate::storage_utils::AsyncStorageManager;
    use crate::terminal::scripted::ScriptedTerminal;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn intersection_keeps_catalog_order_and_drops_duplicates() {
        let available: HashSet<String> = strings(&["GBPUSD", "EURUSD", "XAUUSD"])
            .into_iter()
            .collect();
        let catalog = strings(&["EURUSD", "USDJPY", "GBPUSD", "EURUSD"]);
        assert_eq!(intersect(&catalog, &available), strings(&["EURUSD", "GBPUSD"]));
    }

    #[test]
    fn empty_queues_are_omitted() {
        let mut queues = CandidateQueues::default();
        queues.insert("forex", "deriv", vec![]);
        assert!(queues.is_empty());
        queues.insert("forex", "deriv", strings(&["EURUSD"]));
        assert_eq!(queues.total(), 1);
        assert_eq!(queues.queue_count(), 1);
    }

    #[tokio::test]
    async fn builds_queues_per_broker_and_category() {
        let dir = tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let sink = ErrorSink::new(storage.clone(), "error_log");

        let terminal = ScriptedTerminal::new();
        terminal
            .account(1, 10.0, &["EURUSD", "Volatility 75 Index", "BTCUSD"])
            .account(2, 10.0, &["EURUSD", "GBPUSD"]);
        let mut gate = SessionGate::new(Box::new(terminal.clone()), Duration::from_secs(1));

        let mut brokers = BrokerStore::new();
        for (name, login) in [("deriv", 1), ("xm", 2)] {
            brokers.insert(
                name.to_string(),
                BrokerSettings {
                    terminal_path: PathBuf::from("/t"),
                    login,
                    password: String::new(),
                    server: "s".to_string(),
                    base_folder: PathBuf::from("b"),
                },
            );
        }
        let registry = BrokerRegistry::build(&brokers, &mut gate, &storage, &sink).await;

        let mut catalog = SymbolCatalog::new();
        catalog.insert("forex".to_string(), strings(&["GBPUSD", "EURUSD"]));
        catalog.insert("synthetics".to_string(), strings(&["Volatility 75 Index"]));
        catalog.insert("stocks".to_string(), strings(&["AAPL"]));

        let queues = build_candidate_queues(&registry, &catalog, &mut gate, &sink).await;

        assert_eq!(
            queues.queue("forex", "xm").unwrap(),
            &VecDeque::from(strings(&["GBPUSD", "EURUSD"]))
        );
        assert_eq!(
            queues.queue("forex", "deriv").unwrap(),
            &VecDeque::from(strings(&["EURUSD"]))
        );
        assert!(queues.queue("synthetics", "xm").is_none());
        assert!(queues.queue("stocks", "deriv").is_none());
        assert_eq!(queues.total(), 4);
        assert_eq!(gate.active(), None);
        assert!(sink.records().await.is_empty());
    }
}
