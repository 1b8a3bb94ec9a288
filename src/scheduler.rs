//! # Output scheduler
//!
//! Pure logic — no I/O, no sleeping. Each call to `tick` is a single,
//! non-blocking pass: check for a clock jumpback, age out stale ER
//! candidates, then walk the ring in strict sequence order emitting
//! whatever is both present and due, skipping (and counting) seqs whose
//! repair window has expired.
//!
//! ## Responsibilities
//!
//! 1. **Clock jumpback**: if wall-clock time moves backward between ticks,
//!    treat it as a full timeout — flush the PCM, abort any RCC burst, and
//!    restart the cursor from scratch.
//! 2. **State machine**: `RccApp -> RccRepair -> Normal`. `RccApp` holds
//!    while APP pre-position packets are still being replicated; `RccRepair`
//!    holds until the PCM signals `pre-primary-repairs-done`; `Normal` is
//!    steady-state playout.
//! 3. **Fastfill gating**: while enabled and not yet done, an RCC burst may
//!    emit packets faster than real time (bounded by
//!    `fastfill_max_advance`) to backfill the jitter buffer quickly; once
//!    the advance budget is exhausted fastfill is marked done and normal
//!    real-time pacing resumes.
//! 4. **Minimum backfill**: nothing is emitted until `min_backfill` has
//!    elapsed since the first packet was buffered, so the ring always has a
//!    cushion against early jitter.
//! 5. **Reorder-time interpolation**: a packet's predicted play-out instant
//!    comes from the NLL; packets not yet NLL-anchored interpolate between
//!    the nearest bracketing in-order primaries.
//! 6. **Ordering**: emission strictly follows sequence order. A gap whose
//!    repair window (`gap_hold_time`) has expired is skipped and counted
//!    rather than waited on forever.

use std::time::Duration;

use quanta::Instant;

use crate::config::SchedulerConfig;
use crate::nll::Nll;
use crate::packet::{Packet, PacketFlags};
use crate::pcm::Pcm;
use crate::seqnum::{self, sub};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    RccApp,
    RccRepair,
    Normal,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    nll: Nll,

    next_emit_seq: Option<u32>,
    pending_gap_since: Option<Instant>,
    stream_start: Option<Instant>,

    /// `(seq, rcv_ts)` of the most recently emitted in-order primary, the
    /// left bracket for reorder-time interpolation.
    last_inorder: Option<(u32, Instant)>,

    fastfill_in_progress: bool,
    fastfill_done: bool,
    fastfill_budget_used: Duration,

    last_tick: Option<Instant>,

    pub skipped_seq_count: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, clock_rate_hz: u32, rcc_active: bool) -> Self {
        Scheduler {
            state: if rcc_active { SchedulerState::RccApp } else { SchedulerState::Normal },
            nll: Nll::new(clock_rate_hz),
            next_emit_seq: None,
            pending_gap_since: None,
            stream_start: None,
            last_inorder: None,
            fastfill_in_progress: config.fastfill_enabled && rcc_active,
            fastfill_done: !config.fastfill_enabled,
            fastfill_budget_used: Duration::ZERO,
            last_tick: None,
            skipped_seq_count: 0,
            config,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// A first primary arrived: the APP replication phase of an RCC burst
    /// is over, repairs for the pre-primary gap are now expected.
    pub fn notify_first_primary(&mut self) {
        if self.state == SchedulerState::RccApp {
            tracing::debug!("scheduler state RccApp -> RccRepair");
            self.state = SchedulerState::RccRepair;
        }
    }

    /// PCM signalled that the burst's pre-primary repairs are resolved
    /// (delivered or timed out).
    pub fn rcc_burst_done_notify(&mut self, pcm: &mut Pcm) {
        if self.state == SchedulerState::RccRepair {
            tracing::debug!("scheduler state RccRepair -> Normal");
            self.state = SchedulerState::Normal;
        }
        let _ = pcm;
    }

    pub fn notify_rcc_en_er(&mut self, pcm: &mut Pcm) {
        pcm.notify_rcc_en_er();
    }

    pub fn notify_rcc_abort(&mut self, pcm: &mut Pcm) {
        pcm.notify_rcc_abort();
        self.state = SchedulerState::Normal;
        self.fastfill_in_progress = false;
        self.fastfill_done = true;
        self.reset_cursor();
    }

    fn reset_cursor(&mut self) {
        self.next_emit_seq = None;
        self.pending_gap_since = None;
        self.stream_start = None;
        self.last_inorder = None;
        self.nll.reset();
    }

    fn handle_clock_jumpback(&mut self, now: Instant, pcm: &mut Pcm) -> bool {
        let jumpback = match self.last_tick {
            Some(last) if now < last => true,
            _ => false,
        };
        if jumpback {
            tracing::warn!("clock jumpback detected, flushing pcm and aborting rcc");
            pcm.flush();
            self.notify_rcc_abort(pcm);
        }
        self.last_tick = Some(now);
        jumpback
    }

    /// Run one scheduling pass. Returns packets ready to hand to the
    /// renderer, in strict sequence order.
    pub fn tick(&mut self, pcm: &mut Pcm, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();

        if self.handle_clock_jumpback(now, pcm) {
            return out;
        }

        pcm.timeout_old_candidates(now);

        if pcm.first_primary_seq().is_some() {
            self.notify_first_primary();
        }
        if pcm.is_rcc_burst_done() {
            self.rcc_burst_done_notify(pcm);
        }

        if self.next_emit_seq.is_none() {
            self.next_emit_seq = pcm.head();
            if self.next_emit_seq.is_some() {
                self.stream_start = Some(now);
            }
        }

        // Minimum backfill: hold everything until the cushion has built up.
        if let Some(start) = self.stream_start {
            if now.duration_since(start) < self.config.min_backfill {
                return out;
            }
        } else {
            return out;
        }

        self.update_fastfill_gate(now);

        loop {
            let Some(seq) = self.next_emit_seq else { break };

            let present = pcm.peek(seq).is_some();
            if !present {
                let since = *self.pending_gap_since.get_or_insert(now);
                if now.duration_since(since) >= pcm.gap_hold_time() {
                    // Repair window expired; skip the hole and move on.
                    self.skipped_seq_count += 1;
                    self.pending_gap_since = None;
                    self.next_emit_seq = Some(crate::seqnum::next_seq_num(seq));
                    continue;
                }
                break;
            }
            self.pending_gap_since = None;

            let pak_ref = pcm.peek(seq).unwrap();
            let rtp_ts = pak_ref.rtp_ts;
            let natural_rcv_ts = pak_ref.rcv_ts;
            let reordered = pak_ref.flags.is_set(PacketFlags::REORDERED);

            let rcv_ts = if reordered {
                let next_inorder = pcm.inorder_front().and_then(|s| pcm.peek(s).map(|p| (s, p.rcv_ts)));
                interpolate_rcv_ts(self.last_inorder, next_inorder, seq, natural_rcv_ts)
            } else {
                natural_rcv_ts
            };

            if self.nll.predict(rtp_ts).is_none() {
                self.nll.observe_tracking(rtp_ts, rcv_ts);
            }
            let predicted = self
                .nll
                .predict(rtp_ts)
                .map(|p| p + pcm.default_delay_estimate())
                .unwrap_or(now);

            let due = now >= predicted || self.fastfill_in_progress;
            if !due {
                break;
            }
            if self.fastfill_in_progress {
                let advance = if predicted > now {
                    predicted.duration_since(now)
                } else {
                    Duration::ZERO
                };
                self.fastfill_budget_used += advance.min(Duration::from_millis(1));
                if self.fastfill_budget_used >= self.config.fastfill_max_advance {
                    self.fastfill_in_progress = false;
                    self.fastfill_done = true;
                }
            }

            if !reordered {
                self.last_inorder = Some((seq, natural_rcv_ts));
            }

            let mut pak = pcm.remove_packet(seq).expect("peeked present above");
            pak.pred_ts = Some(predicted);
            out.push(pak);
            self.next_emit_seq = Some(crate::seqnum::next_seq_num(seq));
        }

        out
    }

    fn update_fastfill_gate(&mut self, _now: Instant) {
        if self.fastfill_done {
            self.fastfill_in_progress = false;
            return;
        }
        if !matches!(self.state, SchedulerState::RccApp | SchedulerState::RccRepair) {
            self.fastfill_in_progress = false;
            self.fastfill_done = true;
        }
    }
}

/// Estimate a reordered packet's receive instant by interpolating between
/// the nearest bracketing in-order primaries still known to the scheduler:
/// `last_inorder` (the most recently emitted in-order primary) and
/// `next_inorder` (the earliest in-order primary still buffered in the
/// PCM). Falls back to `natural_rcv_ts` whenever a bracket is missing, the
/// two brackets aren't actually on either side of `seq`, or the brackets'
/// timestamps run backward.
fn interpolate_rcv_ts(
    last_inorder: Option<(u32, Instant)>,
    next_inorder: Option<(u32, Instant)>,
    seq: u32,
    natural_rcv_ts: Instant,
) -> Instant {
    let Some((s_p, t_p)) = last_inorder else {
        return natural_rcv_ts;
    };
    let Some((s_n, t_n)) = next_inorder else {
        return natural_rcv_ts;
    };
    if seqnum::le(seq, s_p) || seqnum::le(s_n, seq) {
        return natural_rcv_ts;
    }
    if t_n < t_p {
        return natural_rcv_ts;
    }
    let span = sub(s_n, s_p);
    if span <= 0 {
        return natural_rcv_ts;
    }
    let step = sub(seq, s_p);
    let per_packet = t_n.duration_since(t_p).div_f64(span as f64);
    t_p + per_packet.mul_f64(step as f64)
}
