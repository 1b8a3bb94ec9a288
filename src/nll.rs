//! # Non-linear loop (NLL) — RTP-timestamp to wall-clock mapping
//!
//! Pure logic — no I/O. Estimates the relationship between the RTP
//! timestamp clock (PCR/90kHz-style, per stream) and the receiver's wall
//! clock, so the scheduler can compute a predicted play-out instant for any
//! buffered packet from its `rtp_ts` alone.
//!
//! ## Responsibilities
//!
//! 1. **Tracking mode**: steady-state operation. Each in-order primary's
//!    `(rtp_ts, rcv_ts)` pair contributes one sample of clock-offset error,
//!    folded into a low-pass filtered estimate. Absorbs encoder clock drift
//!    and jitter without chasing every individual sample.
//! 2. **Non-tracking mode**: during an RCC burst, packets arrive far faster
//!    than real time, so per-packet offset samples are meaningless. Only
//!    the RTP-timestamp delta (how much media time the burst covers) is
//!    accumulated; the filtered offset is left untouched until the burst
//!    ends and a fresh anchor is taken.
//! 3. **`reset`/`adjust` orthogonality**: `reset` discards all state (clock
//!    jumpback, stream flush). `adjust` nudges the filtered offset by a
//!    fixed external delta (a `default_delay` change) without touching the
//!    anchor or the filter's convergence state.

use std::time::Duration;

use quanta::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NllMode {
    Tracking,
    NonTracking,
}

/// One `(rtp_ts, rcv_ts)` anchor pair plus the filtered offset computed
/// relative to it.
struct Anchor {
    rtp_ts: u32,
    rcv_ts: Instant,
}

pub struct Nll {
    clock_rate_hz: u32,
    mode: NllMode,
    anchor: Option<Anchor>,
    /// Low-pass filtered `actual_rcv_ts - predicted_rcv_ts`, signed.
    filtered_offset_ms: f64,
    /// `1/2^gain_shift` is the filter's per-sample weight.
    gain_shift: u32,
    /// Non-tracking mode: RTP-clock time covered since entering the mode.
    accumulated_rtp_ticks: u64,
    non_tracking_base_rtp_ts: Option<u32>,
}

impl Nll {
    pub fn new(clock_rate_hz: u32) -> Self {
        Nll {
            clock_rate_hz,
            mode: NllMode::Tracking,
            anchor: None,
            filtered_offset_ms: 0.0,
            gain_shift: 4, // weight 1/16, matches a typical NLL smoothing constant
            accumulated_rtp_ticks: 0,
            non_tracking_base_rtp_ts: None,
        }
    }

    pub fn mode(&self) -> NllMode {
        self.mode
    }

    fn rtp_ticks_to_duration(&self, ticks: i64) -> Duration {
        let nanos = (ticks.unsigned_abs() as u128) * 1_000_000_000u128 / self.clock_rate_hz as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Clock jumpback or stream flush: discard the anchor and filter state
    /// entirely. The next `observe_tracking` call re-anchors from scratch.
    pub fn reset(&mut self) {
        self.anchor = None;
        self.filtered_offset_ms = 0.0;
        self.accumulated_rtp_ticks = 0;
        self.non_tracking_base_rtp_ts = None;
        self.mode = NllMode::Tracking;
    }

    /// Nudge the filtered offset by a fixed external delta, e.g. when
    /// `default_delay` changes. Does not touch the anchor or accumulated
    /// non-tracking state.
    pub fn adjust(&mut self, delta: Duration, increase: bool) {
        let delta_ms = delta.as_secs_f64() * 1000.0;
        if increase {
            self.filtered_offset_ms += delta_ms;
        } else {
            self.filtered_offset_ms -= delta_ms;
        }
    }

    pub fn enter_non_tracking(&mut self) {
        self.mode = NllMode::NonTracking;
        self.accumulated_rtp_ticks = 0;
        self.non_tracking_base_rtp_ts = None;
    }

    /// Leave non-tracking mode and re-anchor tracking from the most
    /// recently observed `(rtp_ts, rcv_ts)`, discarding the burst's
    /// accumulated-ticks bookkeeping.
    pub fn enter_tracking(&mut self, rtp_ts: u32, rcv_ts: Instant) {
        self.mode = NllMode::Tracking;
        self.anchor = Some(Anchor { rtp_ts, rcv_ts });
        self.accumulated_rtp_ticks = 0;
        self.non_tracking_base_rtp_ts = None;
    }

    /// Feed one in-order primary's timing in tracking mode.
    pub fn observe_tracking(&mut self, rtp_ts: u32, rcv_ts: Instant) {
        let Some(anchor) = &self.anchor else {
            self.anchor = Some(Anchor { rtp_ts, rcv_ts });
            return;
        };
        let rtp_delta = rtp_ts.wrapping_sub(anchor.rtp_ts) as i32 as i64;
        let predicted = anchor.rcv_ts + self.rtp_ticks_to_duration(rtp_delta);
        let sample_ms = if rcv_ts >= predicted {
            rcv_ts.duration_since(predicted).as_secs_f64() * 1000.0
        } else {
            -(predicted.duration_since(rcv_ts).as_secs_f64() * 1000.0)
        };
        let weight = 1.0 / (1u32 << self.gain_shift) as f64;
        self.filtered_offset_ms += (sample_ms - self.filtered_offset_ms) * weight;
    }

    /// Feed one primary's RTP timestamp in non-tracking mode; only the
    /// media-time span covered by the burst is tracked.
    pub fn observe_non_tracking(&mut self, rtp_ts: u32) {
        match self.non_tracking_base_rtp_ts {
            None => self.non_tracking_base_rtp_ts = Some(rtp_ts),
            Some(base) => {
                let delta = rtp_ts.wrapping_sub(base) as i32;
                if delta > 0 {
                    self.accumulated_rtp_ticks = delta as u64;
                }
            }
        }
    }

    pub fn accumulated_media_time(&self) -> Duration {
        self.rtp_ticks_to_duration(self.accumulated_rtp_ticks as i64)
    }

    /// Predict the play-out instant for `rtp_ts`, given the current anchor
    /// and filtered offset. Returns `None` before any sample has been
    /// observed in tracking mode.
    pub fn predict(&self, rtp_ts: u32) -> Option<Instant> {
        let anchor = self.anchor.as_ref()?;
        let rtp_delta = rtp_ts.wrapping_sub(anchor.rtp_ts) as i32 as i64;
        let base = anchor.rcv_ts + self.rtp_ticks_to_duration(rtp_delta);
        let offset_nanos = (self.filtered_offset_ms * 1_000_000.0) as i64;
        Some(if offset_nanos >= 0 {
            base + Duration::from_nanos(offset_nanos as u64)
        } else {
            base - Duration::from_nanos((-offset_nanos) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 90_000;

    #[test]
    fn first_sample_only_anchors_no_prediction_offset() {
        let mut nll = Nll::new(CLOCK);
        let t0 = Instant::now();
        nll.observe_tracking(1000, t0);
        assert_eq!(nll.predict(1000), Some(t0));
    }

    #[test]
    fn steady_cadence_converges_offset_toward_zero() {
        let mut nll = Nll::new(CLOCK);
        let t0 = Instant::now();
        nll.observe_tracking(0, t0);
        for i in 1..50u32 {
            let rtp_ts = i * 3000; // 33ms per packet at 90kHz
            let rcv_ts = t0 + Duration::from_millis(33) * i;
            nll.observe_tracking(rtp_ts, rcv_ts);
        }
        assert!(nll.filtered_offset_ms.abs() < 1.0, "offset={}", nll.filtered_offset_ms);
    }

    #[test]
    fn reset_clears_anchor_and_offset() {
        let mut nll = Nll::new(CLOCK);
        let t0 = Instant::now();
        nll.observe_tracking(0, t0);
        nll.observe_tracking(3000, t0 + Duration::from_millis(50));
        nll.reset();
        assert!(nll.predict(0).is_none());
        assert_eq!(nll.filtered_offset_ms, 0.0);
    }

    #[test]
    fn adjust_shifts_offset_independent_of_anchor() {
        let mut nll = Nll::new(CLOCK);
        let t0 = Instant::now();
        nll.observe_tracking(0, t0);
        nll.adjust(Duration::from_millis(20), true);
        let predicted = nll.predict(0).unwrap();
        assert_eq!(predicted, t0 + Duration::from_millis(20));
    }

    #[test]
    fn non_tracking_accumulates_media_time_without_touching_offset() {
        let mut nll = Nll::new(CLOCK);
        nll.enter_non_tracking();
        nll.observe_non_tracking(0);
        nll.observe_non_tracking(9000); // 100ms of media at 90kHz
        assert_eq!(nll.accumulated_media_time(), Duration::from_millis(100));
        assert_eq!(nll.filtered_offset_ms, 0.0);
    }

    #[test]
    fn enter_tracking_reanchors_and_drops_burst_bookkeeping() {
        let mut nll = Nll::new(CLOCK);
        nll.enter_non_tracking();
        nll.observe_non_tracking(0);
        nll.observe_non_tracking(9000);
        let t0 = Instant::now();
        nll.enter_tracking(9000, t0);
        assert_eq!(nll.mode(), NllMode::Tracking);
        assert_eq!(nll.accumulated_media_time(), Duration::ZERO);
        assert_eq!(nll.predict(9000), Some(t0));
    }
}
