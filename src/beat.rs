//! Beat extraction and RR artifact filtering.
//!
//! The strap repeats the same beat in every page until the next beat occurs,
//! so a new RR interval exists only when the beat counter changes. Intervals
//! are then screened twice: a physiological range check and an adaptive band
//! around the mean of the last few accepted intervals.

use std::collections::VecDeque;

use log::debug;

use crate::hrv;
use crate::page::HeartRatePage;

/// Accepted deltas kept for the adaptive threshold.
pub const FILTER_WINDOW_LEN: usize = 5;
/// Accepted RR intervals kept for RMSSD.
pub const RR_BUFFER_LEN: usize = 30;
/// Beat time field period (65536 ticks / 1024).
pub const BEAT_TIME_ROLLOVER_SECS: f64 = 64.0;
/// Larger gaps are treated as a dropout/reattachment, not as a beat.
pub const DROPOUT_SECS: f64 = 1.5;
/// Shortest plausible interval (~222 bpm).
pub const MIN_RR_SECS: f64 = 0.27;
/// Longest plausible interval (~40 bpm).
pub const MAX_RR_SECS: f64 = 1.5;
/// Allowed deviation from the window mean.
pub const ADAPTIVE_BAND: f64 = 0.3;

/// Why a changed-counter beat was not added to the RR history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OutOfRange,
    Artifact,
}

/// What one page did to the beat history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BeatOutcome {
    /// First page seen, time base established.
    Primed,
    /// Same beat counter as before.
    Duplicate,
    /// Gap longer than [`DROPOUT_SECS`]; filter window cleared.
    Dropout { delta_secs: f64 },
    Rejected { reason: Rejection, delta_secs: f64 },
    Accepted { rr_ms: u32 },
}

/// Stateful RR extractor.
#[derive(Debug, Clone, Default)]
pub struct BeatExtractor {
    /// Uncorrected beat time of the previous page, seconds.
    last_beat_time: Option<f64>,
    last_beat_count: Option<u8>,
    filter_window: VecDeque<f64>,
    rr_buffer: VecDeque<u32>,
    consecutive_rejections: u32,
    raw_rr_ms: u32,
    rr_ms: u32,
    rmssd_ms: f64,
}

impl BeatExtractor {
    pub fn new() -> Self {
        Self {
            filter_window: VecDeque::with_capacity(FILTER_WINDOW_LEN),
            rr_buffer: VecDeque::with_capacity(RR_BUFFER_LEN),
            ..Default::default()
        }
    }

    /// Feed one decoded page.
    pub fn process(&mut self, page: &HeartRatePage) -> BeatOutcome {
        let raw_time = page.beat_time();
        let count = page.beat_count;

        let Some(last_time) = self.last_beat_time else {
            self.remember(raw_time, count);
            return BeatOutcome::Primed;
        };

        let mut beat_time = raw_time;
        if beat_time < last_time {
            beat_time += BEAT_TIME_ROLLOVER_SECS;
        }

        if self.last_beat_count == Some(count) {
            self.last_beat_time = Some(raw_time);
            return BeatOutcome::Duplicate;
        }

        let delta = beat_time - last_time;
        self.raw_rr_ms = (delta * 1000.0).round() as u32;

        if delta > DROPOUT_SECS {
            debug!(
                "beat gap treated as dropout: delta={:.3}s, count={}",
                delta, count
            );
            self.filter_window.clear();
            self.remember(raw_time, count);
            return BeatOutcome::Dropout { delta_secs: delta };
        }

        let outcome = match self.validate(delta) {
            Ok(()) => {
                self.accept(delta);
                BeatOutcome::Accepted { rr_ms: self.rr_ms }
            }
            Err(reason) => {
                debug!(
                    "beat rejected: reason={:?}, delta={:.3}s, streak={}",
                    reason, delta, self.consecutive_rejections
                );
                BeatOutcome::Rejected {
                    reason,
                    delta_secs: delta,
                }
            }
        };

        self.remember(raw_time, count);
        outcome
    }

    fn validate(&mut self, delta: f64) -> std::result::Result<(), Rejection> {
        if !(MIN_RR_SECS..=MAX_RR_SECS).contains(&delta) {
            return Err(Rejection::OutOfRange);
        }
        if let Some(mean) = self.window_mean() {
            if (delta - mean).abs() > mean * ADAPTIVE_BAND {
                self.consecutive_rejections += 1;
                return Err(Rejection::Artifact);
            }
        }
        self.consecutive_rejections = 0;
        Ok(())
    }

    fn accept(&mut self, delta: f64) {
        self.rr_ms = self.raw_rr_ms;

        if self.rr_buffer.len() == RR_BUFFER_LEN {
            self.rr_buffer.pop_front();
        }
        self.rr_buffer.push_back(self.rr_ms);

        if self.filter_window.len() == FILTER_WINDOW_LEN {
            self.filter_window.pop_front();
        }
        self.filter_window.push_back(delta);

        self.rmssd_ms = hrv::rmssd(self.rr_buffer.iter().copied());
    }

    fn remember(&mut self, raw_time: f64, count: u8) {
        self.last_beat_time = Some(raw_time);
        self.last_beat_count = Some(count);
    }

    fn window_mean(&self) -> Option<f64> {
        if self.filter_window.is_empty() {
            return None;
        }
        Some(self.filter_window.iter().sum::<f64>() / self.filter_window.len() as f64)
    }

    /// Most recent accepted RR interval (ms).
    pub fn rr_ms(&self) -> u32 {
        self.rr_ms
    }

    /// Most recent changed-counter interval before filtering (ms).
    pub fn raw_rr_ms(&self) -> u32 {
        self.raw_rr_ms
    }

    pub fn rmssd_ms(&self) -> f64 {
        self.rmssd_ms
    }

    pub fn rr_history(&self) -> &VecDeque<u32> {
        &self.rr_buffer
    }

    pub fn filter_window(&self) -> &VecDeque<f64> {
        &self.filter_window
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive_rejections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageData;
    use proptest::prelude::*;

    fn page_at(secs: f64, count: u8) -> HeartRatePage {
        HeartRatePage {
            page: 4,
            data: PageData::HeartRateOnly,
            beat_ticks: ((secs * 1024.0).round() as u32 % 65536) as u16,
            beat_count: count,
            heart_rate: 60,
        }
    }

    /// Feed a regular rhythm and return the last beat time and counter.
    fn feed_rhythm(ex: &mut BeatExtractor, start: f64, rr: f64, beats: usize) -> (f64, u8) {
        let mut t = start;
        let mut count = 0u8;
        ex.process(&page_at(t, count));
        for _ in 0..beats {
            t += rr;
            count = count.wrapping_add(1);
            ex.process(&page_at(t, count));
        }
        (t, count)
    }

    #[test]
    fn first_page_only_primes() {
        let mut ex = BeatExtractor::new();
        assert_eq!(ex.process(&page_at(1.0, 3)), BeatOutcome::Primed);
        assert!(ex.rr_history().is_empty());
    }

    #[test]
    fn regular_rhythm_is_accepted() {
        let mut ex = BeatExtractor::new();
        ex.process(&page_at(1.0, 0));
        assert_eq!(
            ex.process(&page_at(1.8, 1)),
            BeatOutcome::Accepted { rr_ms: 800 }
        );
        assert_eq!(
            ex.process(&page_at(2.6, 2)),
            BeatOutcome::Accepted { rr_ms: 800 }
        );
        assert_eq!(ex.rr_history().len(), 2);
        assert_eq!(ex.rmssd_ms(), 0.0);
    }

    #[test]
    fn repeated_counter_is_a_duplicate() {
        let mut ex = BeatExtractor::new();
        ex.process(&page_at(1.0, 0));
        ex.process(&page_at(1.8, 1));
        for _ in 0..4 {
            assert_eq!(ex.process(&page_at(1.8, 1)), BeatOutcome::Duplicate);
        }
        assert_eq!(ex.rr_history().len(), 1);
    }

    #[test]
    fn wraparound_adds_sixty_four_seconds() {
        let mut ex = BeatExtractor::new();
        ex.process(&page_at(63.9, 10));
        match ex.process(&page_at(0.05, 11)) {
            BeatOutcome::Rejected {
                reason: Rejection::OutOfRange,
                delta_secs,
            } => assert!((delta_secs - 0.15).abs() < 0.002),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(ex.rr_history().is_empty());
        assert!((ex.raw_rr_ms() as i64 - 150).abs() <= 1);
    }

    #[test]
    fn wraparound_inside_a_normal_rhythm_is_accepted() {
        let mut ex = BeatExtractor::new();
        let (t, count) = feed_rhythm(&mut ex, 61.0, 0.8, 3);
        assert!((t - 63.4).abs() < 1e-9);
        let next = page_at(t + 0.8, count.wrapping_add(1));
        assert_eq!(next.beat_ticks, (0.2 * 1024.0f64).round() as u16);
        assert_eq!(ex.process(&next), BeatOutcome::Accepted { rr_ms: 800 });
    }

    #[test]
    fn large_gap_clears_window_and_keeps_history() {
        let mut ex = BeatExtractor::new();
        let (t, count) = feed_rhythm(&mut ex, 1.0, 0.8, 4);
        assert_eq!(ex.filter_window().len(), 4);
        let before: Vec<u32> = ex.rr_history().iter().copied().collect();

        let outcome = ex.process(&page_at(t + 3.0, count + 1));
        assert!(matches!(outcome, BeatOutcome::Dropout { .. }));
        assert!(ex.filter_window().is_empty());
        let after: Vec<u32> = ex.rr_history().iter().copied().collect();
        assert_eq!(before, after);

        // time base continues from the dropout beat
        assert_eq!(
            ex.process(&page_at(t + 3.8, count + 2)),
            BeatOutcome::Accepted { rr_ms: 800 }
        );
    }

    #[test]
    fn too_short_interval_is_out_of_range() {
        let mut ex = BeatExtractor::new();
        ex.process(&page_at(1.0, 0));
        assert!(matches!(
            ex.process(&page_at(1.2, 1)),
            BeatOutcome::Rejected {
                reason: Rejection::OutOfRange,
                ..
            }
        ));
        assert_eq!(ex.consecutive_rejections(), 0);
        // the rejected beat still moves the time base
        assert_eq!(
            ex.process(&page_at(2.0, 2)),
            BeatOutcome::Accepted { rr_ms: 800 }
        );
    }

    #[test]
    fn adaptive_band_rejects_outliers() {
        let mut ex = BeatExtractor::new();
        let (t, count) = feed_rhythm(&mut ex, 1.0, 0.8, 5);
        let len = ex.rr_history().len();

        // 0.5 s is 37.5% below the 0.8 s mean
        assert!(matches!(
            ex.process(&page_at(t + 0.5, count + 1)),
            BeatOutcome::Rejected {
                reason: Rejection::Artifact,
                ..
            }
        ));
        assert!(matches!(
            ex.process(&page_at(t + 1.6, count + 2)),
            BeatOutcome::Rejected {
                reason: Rejection::Artifact,
                ..
            }
        ));
        assert_eq!(ex.consecutive_rejections(), 2);
        assert_eq!(ex.rr_history().len(), len);

        assert!(matches!(
            ex.process(&page_at(t + 2.4, count + 3)),
            BeatOutcome::Accepted { .. }
        ));
        assert_eq!(ex.consecutive_rejections(), 0);
    }

    #[test]
    fn rmssd_follows_accepted_beats() {
        let mut ex = BeatExtractor::new();
        ex.process(&page_at(1.0, 0));
        ex.process(&page_at(1.8, 1));
        ex.process(&page_at(2.7, 2));
        assert_eq!(ex.rr_history().iter().copied().collect::<Vec<_>>(), [800, 900]);
        assert!((ex.rmssd_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn buffers_are_bounded() {
        let mut ex = BeatExtractor::new();
        feed_rhythm(&mut ex, 1.0, 0.75, 100);
        assert_eq!(ex.rr_history().len(), RR_BUFFER_LEN);
        assert_eq!(ex.filter_window().len(), FILTER_WINDOW_LEN);
    }

    proptest! {
        #[test]
        fn duplicates_never_change_history(start in 0.0f64..60.0, repeats in 1usize..20) {
            let mut ex = BeatExtractor::new();
            let (t, count) = feed_rhythm(&mut ex, start, 0.8, 3);
            let len = ex.rr_history().len();
            for _ in 0..repeats {
                prop_assert_eq!(ex.process(&page_at(t, count)), BeatOutcome::Duplicate);
            }
            prop_assert_eq!(ex.rr_history().len(), len);
        }

        #[test]
        fn plausible_beat_with_empty_window_is_accepted(start in 0.0f64..60.0, rr in 0.28f64..1.49) {
            let mut ex = BeatExtractor::new();
            ex.process(&page_at(start, 0));
            let outcome = ex.process(&page_at(start + rr, 1));
            prop_assert!(matches!(outcome, BeatOutcome::Accepted { .. }), "{:?}", outcome);
            prop_assert_eq!(ex.rr_history().len(), 1);
        }

        #[test]
        fn gaps_over_limit_never_touch_history(gap in 1.52f64..60.0) {
            let mut ex = BeatExtractor::new();
            let (t, count) = feed_rhythm(&mut ex, 0.5, 0.8, 3);
            let len = ex.rr_history().len();
            let outcome = ex.process(&page_at(t + gap, count + 1));
            prop_assert!(matches!(outcome, BeatOutcome::Dropout { .. }), "{:?}", outcome);
            prop_assert!(ex.filter_window().is_empty());
            prop_assert_eq!(ex.rr_history().len(), len);
        }
    }
}
