use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bar timeframes understood by the terminal bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mn1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "m1",
            Timeframe::M5 => "m5",
            Timeframe::M15 => "m15",
            Timeframe::M30 => "m30",
            Timeframe::H1 => "h1",
            Timeframe::H4 => "h4",
            Timeframe::D1 => "d1",
            Timeframe::W1 => "w1",
            Timeframe::Mn1 => "mn1",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalized OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub spread: i64,
    pub real_volume: f64,
}

/// A candle tagged with its position from the oldest element of its sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberedCandle {
    pub candle_number: usize,
    #[serde(flatten)]
    pub candle: Candle,
}

/// Ordered candle sequence for one symbol/timeframe.
///
/// Built only through [`CandleSnapshot::new`] or [`CandleSnapshot::tail`], which
/// number the candles `0..len` from the oldest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<NumberedCandle>,
}

impl CandleSnapshot {
    /// Sorts by time, drops duplicate timestamps (the later bar wins) and numbers the result.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.time);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.time == candle.time => *last = candle,
                _ => deduped.push(candle),
            }
        }

        Self {
            symbol: symbol.into(),
            timeframe,
            candles: number(deduped),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// The last `size` candles renumbered from zero, or `None` when the snapshot is shorter.
    pub fn tail(&self, size: usize) -> Option<CandleSnapshot> {
        if size == 0 || self.len() < size {
            return None;
        }
        let start = self.len() - size;
        let candles = self.candles[start..]
            .iter()
            .map(|c| c.candle.clone())
            .collect();
        Some(Self {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles: number(candles),
        })
    }

    /// Second-to-last candle; the last one may still be forming.
    pub fn latest_completed(&self) -> Option<&Candle> {
        self.len()
            .checked_sub(2)
            .map(|idx| &self.candles[idx].candle)
    }

    pub fn plain_candles(&self) -> Vec<Candle> {
        self.candles.iter().map(|c| c.candle.clone()).collect()
    }
}

fn number(candles: Vec<Candle>) -> Vec<NumberedCandle> {
    candles
        .into_iter()
        .enumerate()
        .map(|(candle_number, candle)| NumberedCandle {
            candle_number,
            candle,
        })
        .collect()
}
