use crate::candle::{Candle, Timeframe};
use crate::config::RetryConfig;
use crate::error::PipelineError;
use crate::terminal::{MarketTerminal, RawBar};
use chrono::DateTime;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub candles: Vec<Candle>,
    pub requested: usize,
}

impl Fetched {
    /// Broker history shorter than the request; accepted, but worth a warning.
    pub fn is_partial(&self) -> bool {
        self.candles.len() < self.requested
    }
}

/// A failed fetch, with how many bars the terminal did hand back (if any answer came at all).
#[derive(Debug)]
pub struct FetchFailure {
    pub error: PipelineError,
    pub available: Option<usize>,
}

impl FetchFailure {
    fn data(message: String, available: Option<usize>) -> Self {
        Self {
            error: PipelineError::Data(message),
            available,
        }
    }
}

/// Pulls bars for one symbol from an open session.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionService {
    attempts: u32,
    delay: Duration,
}

impl AcquisitionService {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            attempts: retry.attempts.max(1),
            delay: Duration::from_millis(retry.delay_ms),
        }
    }

    /// Selects `symbol`, retrying with a fixed delay. Returns the attempt that succeeded.
    pub async fn select_symbol(
        &self,
        terminal: &mut dyn MarketTerminal,
        symbol: &str,
    ) -> Result<u32, PipelineError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match terminal.select_symbol(symbol).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(symbol, attempt, "symbol selected after retry");
                    }
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(symbol, attempt, max = self.attempts, error = %e, "symbol selection failed");
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(PipelineError::Data(format!(
            "{symbol} unavailable after {} attempts: {}",
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Fetches up to `count` bars and normalizes them.
    ///
    /// No answer or zero bars is a data error; fewer bars than requested is accepted.
    pub async fn fetch(
        &self,
        terminal: &mut dyn MarketTerminal,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Fetched, FetchFailure> {
        let raw = match terminal.fetch_bars(symbol, timeframe, count).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(FetchFailure::data(
                    format!("no data returned for {symbol} {timeframe}"),
                    None,
                ));
            }
            Err(e) => {
                return Err(FetchFailure::data(
                    format!("fetching {symbol} {timeframe} failed: {e}"),
                    None,
                ));
            }
        };

        if raw.is_empty() {
            return Err(FetchFailure::data(
                format!("zero bars returned for {symbol} {timeframe}"),
                Some(0),
            ));
        }

        let candles = normalize_bars(symbol, raw);
        if candles.is_empty() {
            return Err(FetchFailure::data(
                format!("no usable bars for {symbol} {timeframe}"),
                Some(0),
            ));
        }

        let fetched = Fetched {
            candles,
            requested: count,
        };
        if fetched.is_partial() {
            warn!(
                symbol,
                %timeframe,
                requested = count,
                available = fetched.candles.len(),
                "broker returned fewer bars than requested"
            );
        }
        Ok(fetched)
    }
}

/// Fixes column types and renames `tick_volume` to `volume`. Bars with an unrepresentable
/// timestamp or non-finite prices are dropped.
pub fn normalize_bars(symbol: &str, raw: Vec<RawBar>) -> Vec<Candle> {
    let total = raw.len();
    let candles: Vec<Candle> = raw
        .into_iter()
        .filter_map(|bar| {
            let time = DateTime::from_timestamp(bar.time, 0)?;
            let prices = [bar.open, bar.high, bar.low, bar.close];
            if !prices.iter().all(|p| p.is_finite()) {
                return None;
            }
            Some(Candle {
                time,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.tick_volume,
                spread: bar.spread.round() as i64,
                real_volume: bar.real_volume,
            })
        })
        .collect();

    if candles.len() < total {
        warn!(symbol, dropped = total - candles.len(), "dropped malformed bars");
    }
    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use crate::session::SessionGate;
    use crate::terminal::scripted::{ScriptedTerminal, raw_bars};
    use std::path::PathBuf;

    fn service() -> AcquisitionService {
        AcquisitionService::new(RetryConfig {
            attempts: 3,
            delay_ms: 1,
        })
    }

    fn settings() -> BrokerSettings {
        BrokerSettings {
            terminal_path: PathBuf::from("/t"),
            login: 1,
            password: String::new(),
            server: "s".to_string(),
            base_folder: PathBuf::from("b"),
        }
    }

    fn gate(terminal: &ScriptedTerminal) -> SessionGate {
        terminal.account(1, 0.0, &["EURUSD"]);
        SessionGate::new(Box::new(terminal.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn selection_succeeds_on_third_attempt() {
        let terminal = ScriptedTerminal::new();
        terminal
            .fail_select("EURUSD", 2)
            .bars("EURUSD", Timeframe::H1, Some(raw_bars(5, 1_700_000_000)));
        let mut gate = gate(&terminal);
        let session = gate.acquire("deriv", &settings()).await.unwrap();

        let svc = service();
        assert_eq!(svc.select_symbol(session, "EURUSD").await.unwrap(), 3);
        let fetched = svc.fetch(session, "EURUSD", Timeframe::H1, 5).await.unwrap();
        assert_eq!(fetched.candles.len(), 5);
        assert!(!fetched.is_partial());
    }

    #[tokio::test]
    async fn selection_gives_up_after_three_attempts() {
        let terminal = ScriptedTerminal::new();
        terminal.fail_select("EURUSD", 3);
        let mut gate = gate(&terminal);
        let session = gate.acquire("deriv", &settings()).await.unwrap();

        let err = service().select_symbol(session, "EURUSD").await.unwrap_err();
        assert_eq!(err.kind(), "DataError");
        let selects = terminal
            .calls()
            .iter()
            .filter(|c| c.starts_with("select:"))
            .count();
        assert_eq!(selects, 3);
    }

    #[tokio::test]
    async fn null_and_empty_fetches_are_data_errors() {
        let terminal = ScriptedTerminal::new();
        terminal
            .bars("EURUSD", Timeframe::H1, None)
            .bars("GBPUSD", Timeframe::H1, Some(vec![]));
        let mut gate = gate(&terminal);
        let session = gate.acquire("deriv", &settings()).await.unwrap();

        let null = service()
            .fetch(session, "EURUSD", Timeframe::H1, 10)
            .await
            .unwrap_err();
        assert_eq!(null.error.kind(), "DataError");
        assert_eq!(null.available, None);

        let empty = service()
            .fetch(session, "GBPUSD", Timeframe::H1, 10)
            .await
            .unwrap_err();
        assert_eq!(empty.available, Some(0));
    }

    #[tokio::test]
    async fn partial_history_is_accepted() {
        let terminal = ScriptedTerminal::new();
        terminal.bars("EURUSD", Timeframe::D1, Some(raw_bars(40, 1_700_000_000)));
        let mut gate = gate(&terminal);
        let session = gate.acquire("deriv", &settings()).await.unwrap();

        let fetched = service()
            .fetch(session, "EURUSD", Timeframe::D1, 500)
            .await
            .unwrap();
        assert_eq!(fetched.candles.len(), 40);
        assert!(fetched.is_partial());
    }

    #[test]
    fn normalization_renames_volume_and_rounds_spread() {
        let mut bars = raw_bars(2, 1_700_000_000);
        bars[0].spread = 2.6;
        bars[1].high = f64::NAN;

        let candles = normalize_bars("EURUSD", bars);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].spread, 3);
        assert_eq!(candles[0].volume, 120.0);
        assert_eq!(candles[0].time.timestamp(), 1_700_000_000 - 3_600);
    }
}
