use crate::config::{BrokerSettings, BrokerStore};
use crate::error::PipelineError;
use crate::error_sink::{ErrorRecord, ErrorSink};
use crate::session::SessionGate;
use crate::storage_utils::AsyncStorageManager;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::info;

static TRAILING_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+$").unwrap());

/// Groups numbered sibling accounts: `"Deriv2"` -> `"deriv"`.
pub fn normalize_identity(identity: &str) -> String {
    TRAILING_DIGITS
        .replace(identity.trim(), "")
        .trim()
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConnection {
    pub identity: String,
    pub normalized: String,
    pub settings: BrokerSettings,
}

/// Persisted once per normalized identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenBrokerMarker {
    pub chosen: bool,
    pub display_name: String,
    pub normalized_identity: String,
    pub balance: f64,
    pub selected_at: DateTime<Utc>,
}

/// One representative account per normalized broker identity.
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    representatives: BTreeMap<String, BrokerConnection>,
    markers: Vec<ChosenBrokerMarker>,
}

impl BrokerRegistry {
    /// Logs into every configured account, keeps the richest per identity and writes the
    /// chosen-broker markers under `chosen_brokers/`.
    ///
    /// Accounts that cannot be reached are logged and skipped. Equal balances resolve to the
    /// account evaluated last (store order).
    pub async fn build(
        brokers: &BrokerStore,
        gate: &mut SessionGate,
        storage: &AsyncStorageManager,
        sink: &ErrorSink,
    ) -> Self {
        let mut groups: BTreeMap<String, Vec<(&String, &BrokerSettings)>> = BTreeMap::new();
        for (identity, settings) in brokers {
            groups
                .entry(normalize_identity(identity))
                .or_default()
                .push((identity, settings));
        }

        let mut registry = Self::default();

        for (normalized, candidates) in groups {
            let mut best: Option<(f64, &String, &BrokerSettings)> = None;

            for (identity, settings) in candidates {
                let balance = match read_balance(gate, identity, settings).await {
                    Ok(balance) => balance,
                    Err(e) => {
                        sink.record(ErrorRecord::new(identity.as_str(), &e)).await;
                        continue;
                    }
                };
                info!(broker = %identity, balance, "account balance read");

                if best.is_none_or(|(top, _, _)| balance >= top) {
                    best = Some((balance, identity, settings));
                }
            }

            let Some((balance, identity, settings)) = best else {
                continue;
            };

            let marker = ChosenBrokerMarker {
                chosen: true,
                display_name: identity.clone(),
                normalized_identity: normalized.clone(),
                balance: round_cents(balance),
                selected_at: Utc::now(),
            };
            info!(
                broker = %normalized,
                chosen = %identity,
                balance = marker.balance,
                "representative selected"
            );

            if let Err(e) = storage
                .save(&format!("chosen_brokers/{normalized}"), &marker)
                .await
            {
                sink.record(ErrorRecord::new(identity.as_str(), &PipelineError::io(e)))
                    .await;
            }

            registry.markers.push(marker);
            registry.representatives.insert(
                normalized.clone(),
                BrokerConnection {
                    identity: identity.clone(),
                    normalized,
                    settings: settings.clone(),
                },
            );
        }

        registry
    }

    pub fn representatives(&self) -> impl Iterator<Item = &BrokerConnection> {
        self.representatives.values()
    }

    #[cfg(test)]
    pub fn get(&self, normalized: &str) -> Option<&BrokerConnection> {
        self.representatives.get(normalized)
    }

    pub fn markers(&self) -> &[ChosenBrokerMarker] {
        &self.markers
    }

    pub fn is_empty(&self) -> bool {
        self.representatives.is_empty()
    }

    pub fn len(&self) -> usize {
        self.representatives.len()
    }
}

async fn read_balance(
    gate: &mut SessionGate,
    identity: &str,
    settings: &BrokerSettings,
) -> Result<f64, PipelineError> {
    let outcome = match gate.acquire(identity, settings).await {
        Ok(terminal) => terminal
            .account_balance()
            .await
            .map_err(|e| PipelineError::Connection(format!("{identity}: {e}"))),
        Err(e) => Err(e),
    };
    gate.release().await;
    outcome
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
