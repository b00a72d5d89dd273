use crate::candle::Candle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtremumKind {
    #[serde(rename = "PH")]
    ParentHigh,
    #[serde(rename = "PL")]
    ParentLow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtremumLabel {
    pub kind: ExtremumKind,
    pub value: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtremaLabels {
    pub highs: Vec<ExtremumLabel>,
    pub lows: Vec<ExtremumLabel>,
}

/// Windowed structural high/low detection.
#[derive(Debug, Clone, Copy)]
pub struct ExtremaDetector {
    left: usize,
    right: usize,
}

impl ExtremaDetector {
    pub fn new(left: usize, right: usize) -> Self {
        Self { left, right }
    }

    /// Scans `candles` left to right.
    ///
    /// Index `i` is a parent high when the full right window `i+1..=i+R` exists and every
    /// high in it is strictly below `high[i]`, and every high in the (possibly truncated)
    /// left window `i-L..i` is strictly below as well. An empty left window does not block.
    /// Parent lows mirror this on lows.
    pub fn detect(&self, candles: &[Candle]) -> ExtremaLabels {
        let mut labels = ExtremaLabels::default();
        let n = candles.len();
        if self.right == 0 || n <= self.right {
            return labels;
        }

        for i in 0..n - self.right {
            let left = &candles[i.saturating_sub(self.left)..i];
            let right = &candles[i + 1..=i + self.right];
            let candle = &candles[i];

            let beats_high = |c: &Candle| candle.high > c.high;
            if right.iter().all(beats_high) && left.iter().all(beats_high) {
                labels.highs.push(ExtremumLabel {
                    kind: ExtremumKind::ParentHigh,
                    value: candle.high,
                    time: candle.time,
                });
            }

            let beats_low = |c: &Candle| candle.low < c.low;
            if right.iter().all(beats_low) && left.iter().all(beats_low) {
                labels.lows.push(ExtremumLabel {
                    kind: ExtremumKind::ParentLow,
                    value: candle.low,
                    time: candle.time,
                });
            }
        }

        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::fixtures::with_highs_lows;

    fn flat(n: usize) -> (Vec<f64>, Vec<f64>) {
        (vec![10.0; n], vec![5.0; n])
    }

    #[test]
    fn flags_exactly_the_peak() {
        let (mut highs, lows) = flat(12);
        highs[6] = 15.0;
        highs[5] = 12.0;
        highs[7] = 12.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(3, 3).detect(&candles);
        assert_eq!(labels.highs.len(), 1);
        assert_eq!(labels.highs[0].value, 15.0);
        assert_eq!(labels.highs[0].time, candles[6].time);
        assert_eq!(labels.highs[0].kind, ExtremumKind::ParentHigh);
        // Equal neighbours never qualify.
        assert!(labels.lows.is_empty());
    }

    #[test]
    fn short_left_window_does_not_suppress() {
        let (mut highs, lows) = flat(8);
        highs[1] = 20.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(5, 3).detect(&candles);
        assert_eq!(labels.highs.len(), 1);
        assert_eq!(labels.highs[0].time, candles[1].time);
    }

    #[test]
    fn first_candle_has_vacuous_left_window() {
        let (mut highs, lows) = flat(6);
        highs[0] = 20.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(2, 2).detect(&candles);
        assert_eq!(labels.highs.len(), 1);
        assert_eq!(labels.highs[0].time, candles[0].time);
    }

    #[test]
    fn tail_without_full_right_window_is_ignored() {
        let (mut highs, lows) = flat(10);
        highs[8] = 30.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(2, 2).detect(&candles);
        assert!(labels.highs.is_empty());

        highs[7] = 30.0;
        highs[8] = 10.0;
        let candles = with_highs_lows(&highs, &lows);
        let labels = ExtremaDetector::new(2, 2).detect(&candles);
        assert_eq!(labels.highs.len(), 1);
        assert_eq!(labels.highs[0].time, candles[7].time);
    }

    #[test]
    fn left_neighbour_above_suppresses() {
        let (mut highs, lows) = flat(10);
        highs[3] = 18.0;
        highs[5] = 16.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(3, 3).detect(&candles);
        assert_eq!(labels.highs.len(), 1);
        assert_eq!(labels.highs[0].value, 18.0);
    }

    #[test]
    fn lows_mirror_highs_and_keep_order() {
        let (highs, mut lows) = flat(14);
        lows[3] = 1.0;
        lows[9] = 2.0;
        let candles = with_highs_lows(&highs, &lows);

        let labels = ExtremaDetector::new(2, 2).detect(&candles);
        let times: Vec<_> = labels.lows.iter().map(|l| l.time).collect();
        assert_eq!(times, vec![candles[3].time, candles[9].time]);
        assert!(labels.lows.iter().all(|l| l.kind == ExtremumKind::ParentLow));
    }

    #[test]
    fn too_short_series_yields_nothing() {
        let candles = with_highs_lows(&[1.0, 2.0], &[0.5, 0.4]);
        assert_eq!(
            ExtremaDetector::new(1, 2).detect(&candles),
            ExtremaLabels::default()
        );
    }
}
