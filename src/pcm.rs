//! # Packet Cache Manager
//!
//! The sequence-indexed store of record: owns the `pak_seq` ring, the gap
//! bitmap, the in-order tail queue, the candidate array that drives
//! early-retransmission eligibility, and the TR-135 loss trackers. Every
//! other component (FEC, the scheduler) reads and writes through here
//! rather than touching the ring or bitmap directly.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::bitmap::GapBitmap;
use crate::config::PcmConfig;
use crate::error::PcmInsertError;
use crate::pakseq::{InsertOutcome, PakSeq};
use crate::packet::{Packet, PacketFlags, PacketType};
use crate::seqnum::{self, sub};
use crate::tr135::{LossTracker, RingStats, Tr135Params};

/// `(start_seq, extent)`: the closed range `[start_seq, start_seq+extent]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
    pub start_seq: u32,
    pub extent: u32,
}

struct Candidate {
    seq: u32,
    rcv_ts: Instant,
}

pub struct Pcm {
    config: PcmConfig,
    pool_capacity: usize,

    pak_seq: PakSeq,
    bitmap: GapBitmap,

    /// Lowest / highest seq currently present, when non-empty.
    head: Option<u32>,
    tail: Option<u32>,

    /// Reference for 16->32 lifts, and the most recently lifted seq seen.
    reference: u32,

    /// Last seq handed to the downstream scheduler; `None` means "invalid"
    /// (fresh start or just reset by an under-run).
    last_pak_seq: Option<u32>,

    /// Upper bound on seqs eligible for retransmission request.
    highest_er_seq_num: u32,
    last_requested_er_seq_num: Option<u32>,
    er_enabled: bool,
    er_first_call: bool,
    pktflow_src_seq_num_start: Option<u32>,

    inorder_queue: VecDeque<u32>,
    candidates: VecDeque<Candidate>,

    fec_delay: Duration,
    default_delay: Duration,
    gap_hold_time: Duration,
    dyn_jitter_buf_active: bool,
    rcc_active: bool,

    delay_from_apps: Duration,

    last_primary_seq: Option<u32>,
    last_primary_rtp_ts: Option<u32>,
    new_rtp_ts_pkt_time: Option<u32>,
    ts_calculation_done: bool,

    first_primary_seq: Option<u32>,
    pre_primary_repairs_done_called: bool,
    rcc_burst_done: bool,

    pre_ec: LossTracker,
    post_ec: LossTracker,
    ring_stats: RingStats,

    pre_primary_callback: Option<Box<dyn FnMut() + Send>>,
}

impl Pcm {
    pub fn new(config: PcmConfig, bucket_bits: u8, tr135_params: Tr135Params) -> Option<Self> {
        let pak_seq = PakSeq::new(bucket_bits)?;
        let bitmap = GapBitmap::create(config.bitmap_size).ok()?;
        let default_delay = config.configured_delay;
        let gap_hold_time = config.reorder_delay;
        Some(Pcm {
            pool_capacity: 1usize << bucket_bits,
            pak_seq,
            bitmap,
            head: None,
            tail: None,
            reference: seqnum::INITIAL_REFERENCE,
            last_pak_seq: None,
            highest_er_seq_num: 0,
            last_requested_er_seq_num: None,
            er_enabled: config.er_enabled,
            er_first_call: true,
            pktflow_src_seq_num_start: None,
            inorder_queue: VecDeque::new(),
            candidates: VecDeque::with_capacity(config.candidate_array_len),
            fec_delay: Duration::ZERO,
            default_delay,
            gap_hold_time,
            dyn_jitter_buf_active: false,
            rcc_active: config.rcc_enabled,
            delay_from_apps: Duration::ZERO,
            last_primary_seq: None,
            last_primary_rtp_ts: None,
            new_rtp_ts_pkt_time: None,
            ts_calculation_done: false,
            first_primary_seq: None,
            pre_primary_repairs_done_called: false,
            rcc_burst_done: false,
            pre_ec: LossTracker::new(tr135_params),
            post_ec: LossTracker::new(tr135_params),
            ring_stats: RingStats::default(),
            pre_primary_callback: None,
            config,
        })
    }

    pub fn set_pre_primary_callback(&mut self, cb: Box<dyn FnMut() + Send>) {
        self.pre_primary_callback = Some(cb);
    }

    pub fn head(&self) -> Option<u32> {
        self.head
    }
    pub fn tail(&self) -> Option<u32> {
        self.tail
    }
    pub fn ring_stats(&self) -> &RingStats {
        &self.ring_stats
    }
    pub fn pre_ec_stats(&self) -> &crate::tr135::LossStats {
        self.pre_ec.stats()
    }
    pub fn post_ec_stats(&self) -> &crate::tr135::LossStats {
        self.post_ec.stats()
    }
    pub fn gap_hold_time(&self) -> Duration {
        self.gap_hold_time
    }
    pub fn fec_delay(&self) -> Duration {
        self.fec_delay
    }
    pub fn last_pak_seq(&self) -> Option<u32> {
        self.last_pak_seq
    }

    /// Look up a packet still resident in the ring without removing it.
    pub fn peek(&self, seq: u32) -> Option<&Packet> {
        self.pak_seq.find(seq)
    }

    /// Read-only access to the presence bitmap, for the FEC decoder's
    /// strided missing-primary search.
    pub fn bitmap(&self) -> &GapBitmap {
        &self.bitmap
    }

    /// Flag a just-inserted repair as FEC-recovered (`AFTER_EC`), so a later
    /// arriving true primary at the same seq is recognized as confirmation
    /// rather than a plain duplicate.
    pub fn mark_after_ec(&mut self, seq: u32) {
        let Some(mut pak) = self.pak_seq.delete(seq) else {
            return;
        };
        pak.flags.set(PacketFlags::AFTER_EC);
        let (outcome, leftover) = self.pak_seq.insert(pak);
        debug_assert!(matches!(outcome, InsertOutcome::Inserted));
        debug_assert!(leftover.is_none());
    }

    /// Earliest seq still waiting in the in-order tail queue, if any.
    pub fn inorder_front(&self) -> Option<u32> {
        self.inorder_queue.front().copied()
    }

    pub fn pop_inorder_front(&mut self) -> Option<u32> {
        self.inorder_queue.pop_front()
    }

    pub fn first_primary_seq(&self) -> Option<u32> {
        self.first_primary_seq
    }

    /// Current delay budget (FEC wait + configured jitter cushion) the
    /// scheduler adds on top of the NLL's predicted arrival instant.
    pub fn default_delay_estimate(&self) -> Duration {
        self.default_delay
    }

    /// Called whenever the FEC decoder (re)learns `fec_delay` from `L`/`D`/
    /// sending order; recomputes the two delays derived from it.
    pub fn set_fec_delay(&mut self, fec_delay: Duration) {
        self.fec_delay = fec_delay;
        self.gap_hold_time = fec_delay + self.config.reorder_delay;
        self.default_delay = self.config.configured_delay + fec_delay;
    }

    /// Lift a wire seq against the current reference without mutating
    /// state — used by callers (FEC) that need to lift a seq belonging to a
    /// different ring but sharing this PCM's generation.
    pub fn lift(&self, wire: u16) -> u32 {
        seqnum::lift(self.reference, wire)
    }

    fn bump_generation(&mut self) {
        self.reference = seqnum::mark_discontinuity(self.reference);
    }

    /// Insert one packet. `wire_seq` is the 16-bit RTP sequence number;
    /// returns the 32-bit lifted sequence on success.
    pub fn insert_packet(
        &mut self,
        wire_seq: u16,
        rtp_ts: u32,
        rcv_ts: Instant,
        kind: PacketType,
        payload: Bytes,
    ) -> Result<u32, PcmInsertError> {
        let mut bump = false;

        // 1. Overflow: ring is full, flush and bump.
        if self.pak_seq.num_paks() as usize >= self.pool_capacity {
            tracing::warn!(capacity = self.pool_capacity, "pcm ring overflow, flushing");
            self.flush();
            self.ring_stats.overruns += 1;
            bump = true;
        }

        // 2. Under-run: ring just went empty while the scheduler still
        // holds a valid last-emitted seq. Suppressed during an RCC burst.
        if self.pak_seq.num_paks() == 0 && self.last_pak_seq.is_some() && !self.rcc_active {
            tracing::debug!("pcm ring underrun, resetting output state");
            self.ring_stats.underruns += 1;
            self.last_pak_seq = None;
            if self.dyn_jitter_buf_active {
                self.default_delay = self.config.configured_delay + self.fec_delay;
            }
            self.delay_from_apps = Duration::ZERO;
            bump = true;
        }

        if bump {
            self.bump_generation();
        }

        let lifted = seqnum::lift(self.reference, wire_seq);
        self.reference = lifted;

        let mut pak = Packet::new(lifted, rtp_ts, rcv_ts, kind, payload);

        // 3. APP replication delay accumulation / inheritance.
        if kind == PacketType::App {
            self.delay_from_apps += self.config.app_replication_delay;
        }
        pak.app_cpy_delay = self.delay_from_apps;

        // 4. Duplicate check.
        let existing_shape = self
            .pak_seq
            .find(lifted)
            .map(|existing| (existing.kind, existing.flags.is_set(PacketFlags::AFTER_EC)));
        if let Some((existing_kind, after_ec)) = existing_shape {
            if kind == PacketType::Primary && existing_kind == PacketType::Repair && after_ec {
                // The real primary confirms what EC already reconstructed;
                // fix the flag in place rather than treating this as waste.
                self.clear_after_ec_flag(lifted);
                return Ok(lifted);
            }
            self.ring_stats.duplicates += 1;
            return Err(PcmInsertError::Duplicate);
        }

        // 5. Range check.
        if let (Some(head), Some(tail)) = (self.head, self.tail) {
            if sub(lifted, tail) > self.config.max_gap as i32 || sub(head, lifted) > self.config.max_gap as i32 {
                self.ring_stats.overruns += 1;
                return Err(PcmInsertError::OutOfRange);
            }
            if let Some(last) = self.last_pak_seq {
                if seqnum::le(lifted, last) {
                    self.ring_stats.late_packets += 1;
                    return Err(PcmInsertError::TooLate);
                }
            }
        }

        // 6. Accept.
        let mut reordered = kind == PacketType::Repair;
        match (self.head, self.tail) {
            (None, None) => {
                self.head = Some(lifted);
                self.tail = Some(lifted);
            }
            (Some(head), Some(tail)) => {
                if seqnum::lt(lifted, head) {
                    if sub(head, lifted) > 1 {
                        self.ring_stats.input_loss_holes += 1;
                    }
                    self.head = Some(lifted);
                } else if seqnum::gt(lifted, tail) {
                    if sub(lifted, tail) > 1 {
                        self.ring_stats.input_loss_holes += 1;
                    }
                    self.tail = Some(lifted);
                } else {
                    reordered = true;
                }
            }
            _ => unreachable!(),
        }
        if reordered {
            pak.flags.set(PacketFlags::REORDERED);
        }

        // A primary that extended (or established) the tail arrived in
        // order; anything landing behind tail or of kind `Repair` did not.
        let is_inorder_primary = kind == PacketType::Primary && !reordered && self.tail == Some(lifted);

        self.bitmap.set_bit(lifted);
        self.pak_seq.insert(pak);

        if is_inorder_primary {
            self.inorder_queue.push_back(lifted);
            self.update_candidates(lifted, rcv_ts);
            if self.first_primary_seq.is_none() {
                self.first_primary_seq = Some(lifted);
            }
        }

        // 7. Inter-packet-time estimation for primaries.
        if kind == PacketType::Primary {
            if let (Some(prev_seq), Some(prev_ts)) = (self.last_primary_seq, self.last_primary_rtp_ts) {
                let has_discontinuity = self
                    .pak_seq
                    .find(lifted)
                    .map(|p| p.flags.is_set(PacketFlags::DISCONTINUITY))
                    .unwrap_or(false);
                if lifted == seqnum::next_seq_num(prev_seq) && !has_discontinuity && rtp_ts > prev_ts {
                    self.new_rtp_ts_pkt_time = Some(rtp_ts - prev_ts);
                    self.ts_calculation_done = true;
                }
            }
            self.last_primary_seq = Some(lifted);
            self.last_primary_rtp_ts = Some(rtp_ts);
        }

        self.maybe_fire_pre_primary_callback();

        Ok(lifted)
    }

    /// `PakSeq` only exposes an immutable `find`; flag-clearing is the sole
    /// mutate-in-place need here, so go through delete+reinsert.
    fn clear_after_ec_flag(&mut self, seq: u32) {
        let Some(mut pak) = self.pak_seq.delete(seq) else {
            return;
        };
        pak.flags.clear(PacketFlags::AFTER_EC);
        let (outcome, leftover) = self.pak_seq.insert(pak);
        debug_assert!(matches!(outcome, InsertOutcome::Inserted));
        debug_assert!(leftover.is_none());
    }

    fn maybe_fire_pre_primary_callback(&mut self) {
        if self.pre_primary_repairs_done_called {
            return;
        }
        let Some(first_primary) = self.first_primary_seq else {
            return;
        };
        let repair_seq = seqnum::prev_seq_num(first_primary);
        if self.pak_seq.find(repair_seq).is_some() {
            tracing::debug!(seq = repair_seq, "pre-primary repairs done");
            self.pre_primary_repairs_done_called = true;
            self.rcc_burst_done = true;
            if let Some(cb) = self.pre_primary_callback.as_mut() {
                cb();
            }
        }
    }

    pub fn is_rcc_burst_done(&self) -> bool {
        self.rcc_burst_done
    }

    /// Remove a packet by sequence number, updating head/tail/inorder queue.
    pub fn remove_packet(&mut self, seq: u32) -> Option<Packet> {
        let pak = self.pak_seq.delete(seq)?;
        self.bitmap.clear_bit(seq);
        self.inorder_queue.retain(|&s| s != seq);

        if self.head == Some(seq) || self.tail == Some(seq) {
            self.recompute_extremum_after_removal(seq);
        }

        if !pak.flags.is_set(PacketFlags::AFTER_EC) {
            self.pre_ec.observe(seq);
        }
        self.post_ec.observe(seq);

        self.last_pak_seq = Some(seq);
        Some(pak)
    }

    /// Walk forward/backward from a removed head/tail extremum to the next
    /// occupied seq, bounded by the ring's bucket count since the true
    /// extremum (if any remain) can never be farther away than that.
    fn recompute_extremum_after_removal(&mut self, removed: u32) {
        if self.pak_seq.num_paks() == 0 {
            self.head = None;
            self.tail = None;
            return;
        }
        let steps = self.pool_capacity as u32;

        if self.head == Some(removed) {
            let mut candidate = seqnum::next_seq_num(removed);
            for _ in 0..steps {
                if self.pak_seq.find(candidate).is_some() {
                    self.head = Some(candidate);
                    break;
                }
                candidate = seqnum::next_seq_num(candidate);
            }
        }
        if self.tail == Some(removed) {
            let mut candidate = seqnum::prev_seq_num(removed);
            for _ in 0..steps {
                if self.pak_seq.find(candidate).is_some() {
                    self.tail = Some(candidate);
                    break;
                }
                candidate = seqnum::prev_seq_num(candidate);
            }
        }
    }

    pub fn flush(&mut self) {
        self.pak_seq.flush();
        self.bitmap.flush();
        self.head = None;
        self.tail = None;
        self.inorder_queue.clear();
        self.candidates.clear();
    }

    // ─── Candidate array ──────────────────────────────────────────────

    fn bucket_width(&self) -> Duration {
        self.gap_hold_time / self.config.candidate_array_len.max(1) as u32
    }

    fn update_candidates(&mut self, seq: u32, rcv_ts: Instant) {
        let width = self.bucket_width();
        let should_insert = match self.candidates.back() {
            None => true,
            Some(last) => rcv_ts.duration_since(last.rcv_ts) > width,
        };
        if should_insert {
            self.evict_aged_candidates(rcv_ts);
            if self.candidates.len() == self.config.candidate_array_len {
                self.candidates.pop_front();
            }
            self.candidates.push_back(Candidate { seq, rcv_ts });
        }
    }

    fn evict_aged_candidates(&mut self, now: Instant) {
        while let Some(front) = self.candidates.front() {
            if now.duration_since(front.rcv_ts) > self.gap_hold_time {
                self.candidates.pop_front();
            } else {
                break;
            }
        }
    }

    /// Advance `highest_er_seq_num` based on candidate age; called every
    /// scheduler tick where no fresh candidate arrived.
    pub fn timeout_old_candidates(&mut self, now: Instant) {
        self.evict_aged_candidates(now);
        if let Some(front) = self.candidates.front() {
            self.highest_er_seq_num = front.seq;
        }
        // Candidate array exhausted: leave `highest_er_seq_num` where it is.
        // Snapping it to `tail` would report gaps younger than `gap_hold_time`,
        // which primaries never reached a candidate slot for (every FEC-recovered
        // or repair-derived insert is flagged reordered and skips `update_candidates`).
    }

    // ─── Gap reporting ────────────────────────────────────────────────

    pub fn notify_rcc_en_er(&mut self) {
        self.er_enabled = true;
        if let Some(head) = self.head {
            self.last_requested_er_seq_num = Some(seqnum::prev_seq_num(head));
        }
        if let Some(tail) = self.tail {
            self.highest_er_seq_num = tail;
        }
    }

    pub fn notify_rcc_abort(&mut self) {
        self.flush();
        self.dyn_jitter_buf_active = false;
        self.default_delay = self.config.configured_delay + self.fec_delay;
        self.delay_from_apps = Duration::ZERO;
        self.rcc_active = false;
        self.rcc_burst_done = true;
    }

    pub fn set_pktflow_src_seq_num_start(&mut self, seq: u32) {
        self.pktflow_src_seq_num_start = Some(seq);
    }

    /// Returns up to `buf.len()` gap runs eligible for retransmission, and
    /// whether more remain (`more`).
    pub fn get_gaps(&mut self, buf: &mut [GapRecord]) -> (usize, bool) {
        if self.er_first_call {
            if let Some(now_ref) = self.candidates.back().map(|c| c.rcv_ts) {
                self.timeout_old_candidates(now_ref + self.gap_hold_time + Duration::from_millis(1));
            }
            self.er_first_call = false;
        }

        let Some(head) = self.head else {
            return (0, false);
        };

        let mut seq1 = match self.last_requested_er_seq_num {
            Some(last) => {
                let candidate = seqnum::next_seq_num(last);
                if seqnum::gt(candidate, head) {
                    candidate
                } else {
                    head
                }
            }
            None => head,
        };

        if let Some(clamp) = self.pktflow_src_seq_num_start.take() {
            if seqnum::gt(clamp, seq1) {
                seq1 = clamp;
            }
        }

        let seq2 = self.highest_er_seq_num;
        if seqnum::gt(seq1, seq2) {
            return (0, false);
        }

        let mut raw_buf = vec![crate::bitmap::GapRecord { start_seq: 0, extent: 0 }; buf.len()];
        let (count, more) = self.bitmap.gap_runs(seq1, seq2, &mut raw_buf);
        for (dst, src) in buf.iter_mut().zip(raw_buf.iter()).take(count) {
            *dst = GapRecord {
                start_seq: src.start_seq,
                extent: src.extent,
            };
        }

        let highest_collected = raw_buf[..count]
            .last()
            .map(|g| g.start_seq + g.extent)
            .unwrap_or(seq1);
        self.last_requested_er_seq_num = Some(if more { highest_collected } else { seq2 });

        (count, more)
    }
}
