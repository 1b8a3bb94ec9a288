//! # TR-135 loss/underrun/overrun accounting
//!
//! A small state machine per tracked stream (pre-EC and post-EC are two
//! independent instances) following TR-135's loss-event definition: a run of
//! consecutive missing sequence numbers is a loss event; it closes once
//! `gmin` consecutive good packets have been seen. `gmin == 0` disables
//! accounting outright — every call becomes a no-op.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossState {
    Ok,
    EnterLossEvent,
}

/// Parameters controlling the loss-event state machine.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Tr135Params {
    /// Consecutive good packets required to close a loss event. `0` disables
    /// accounting entirely.
    pub gmin: u32,
    /// Good-run length at or below which a closed loss event counts as
    /// "severe" (i.e. losses recurring in quick succession).
    pub severe_loss_min_distance: u32,
}

impl Default for Tr135Params {
    fn default() -> Self {
        Tr135Params {
            gmin: 5,
            severe_loss_min_distance: 10,
        }
    }
}

/// Snapshot of one loss-tracking instance's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LossStats {
    pub loss_events: u64,
    pub severe_loss_events: u64,
    pub packets_lost: u64,
    pub packets_expected: u64,
    /// Minimum loss distance: shortest good run observed between two loss events.
    pub min_loss_distance: u32,
    /// Maximum loss period: longest run of consecutive missing packets.
    pub max_loss_period: u32,
}

/// One loss-event state machine instance (used once for pre-EC, once for
/// post-EC accounting).
pub struct LossTracker {
    params: Tr135Params,
    state: LossState,
    last_seq: Option<u32>,
    good_run: u32,
    bad_run: u32,
    have_closed_one: bool,
    stats: LossStats,
}

impl LossTracker {
    pub fn new(params: Tr135Params) -> Self {
        LossTracker {
            params,
            state: LossState::Ok,
            last_seq: None,
            good_run: 0,
            bad_run: 0,
            have_closed_one: false,
            stats: LossStats::default(),
        }
    }

    pub fn stats(&self) -> &LossStats {
        &self.stats
    }

    /// Feed the next observed sequence number (order of arrival at this
    /// tracking point, which for post-EC accounting may differ from wire
    /// order since repairs reorder in).
    pub fn observe(&mut self, seq: u32) {
        if self.params.gmin == 0 {
            return;
        }

        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            self.stats.packets_expected += 1;
            return;
        };

        let gap = crate::seqnum::sub(seq, last) - 1;
        self.last_seq = Some(seq);
        self.stats.packets_expected += 1;

        match self.state {
            LossState::Ok => {
                if gap >= 1 {
                    self.enter_loss_event(gap as u32);
                } else {
                    self.good_run += 1;
                }
            }
            LossState::EnterLossEvent => {
                if gap >= 1 {
                    self.bad_run += gap as u32;
                    self.stats.packets_lost += gap as u32;
                } else {
                    self.good_run += 1;
                    if self.good_run >= self.params.gmin {
                        self.close_loss_event();
                    }
                }
            }
        }
    }

    fn enter_loss_event(&mut self, initial_gap: u32) {
        if self.have_closed_one && self.good_run <= self.params.severe_loss_min_distance {
            self.stats.severe_loss_events += 1;
        }
        if self.good_run > 0 && (self.stats.min_loss_distance == 0 || self.good_run < self.stats.min_loss_distance) {
            self.stats.min_loss_distance = self.good_run;
        }
        self.state = LossState::EnterLossEvent;
        self.bad_run = initial_gap;
        self.stats.packets_lost += initial_gap;
        self.good_run = 0;
        tracing::debug!(initial_gap, "tr-135 loss event opened");
    }

    fn close_loss_event(&mut self) {
        self.stats.loss_events += 1;
        self.have_closed_one = true;
        if self.bad_run > self.stats.max_loss_period {
            self.stats.max_loss_period = self.bad_run;
        }
        tracing::debug!(bad_run = self.bad_run, "tr-135 loss event closed");
        self.bad_run = 0;
        self.state = LossState::Ok;
        // good_run carries over as the start of the next OK-state run.
    }
}

/// Under-run / over-run / output-gap counters, separate from the loss-event
/// state machine above since they reflect ring/scheduler events rather than
/// per-packet sequence gaps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RingStats {
    pub overruns: u64,
    pub underruns: u64,
    pub duplicates: u64,
    pub late_packets: u64,
    /// Count of missing-sequence holes observed pre-first-primary (RCC
    /// burst still in progress) vs post-first-primary (steady state).
    pub output_gap_pre_first_primary: u64,
    pub output_gap_post_first_primary: u64,
    /// `num_loss_pak`/`input_loss_hole_counter` from the source: total holes
    /// the gap reporter has ever surfaced, independent of whether they were
    /// later repaired.
    pub input_loss_holes: u64,
}
