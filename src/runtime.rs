//! # Runtime handle
//!
//! Bundles one channel's PCM, FEC decoder, and output scheduler behind a
//! single owned handle, replacing the source implementation's reliance on
//! process-global state (one static `vqec_pcm_t` table indexed by channel
//! handle). A host process holds one `Runtime` per tuned channel.
//!
//! Construction is the one place this crate uses `anyhow` — bucket sizing
//! and bitmap sizing can fail for out-of-range inputs, and a config loading
//! boundary is exactly where the teacher reaches for `anyhow::Context`
//! rather than a typed error (see `FecInsertError`/`PcmInsertError` for the
//! hot-path alternative).

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use quanta::Instant;

use crate::config::{FecConfig, PcmConfig, SchedulerConfig};
use crate::error::FecDecError;
use crate::fec::{self, FecDecoder};
use crate::packet::{Packet, PacketType};
use crate::pcm::Pcm;
use crate::scheduler::Scheduler;
use crate::tr135::Tr135Params;
use crate::wire::{FecAxis, FecHeader};

pub struct Runtime {
    pcm: Pcm,
    fec: FecDecoder,
    scheduler: Scheduler,
    clock_rate_hz: u32,
}

pub struct RuntimeConfig {
    pub pcm: PcmConfig,
    pub fec: FecConfig,
    pub scheduler: SchedulerConfig,
    pub tr135: Tr135Params,
    pub pcm_bucket_bits: u8,
    pub clock_rate_hz: u32,
    pub rcc_active: bool,
}

impl Runtime {
    pub fn new(cfg: RuntimeConfig) -> Result<Self> {
        let pcm = Pcm::new(cfg.pcm, cfg.pcm_bucket_bits, cfg.tr135)
            .context("pcm bucket_bits or bitmap_size out of range")?;
        let fec = if cfg.fec.two_d {
            FecDecoder::new_2d(cfg.fec.bucket_bits)
        } else {
            FecDecoder::new_1d(cfg.fec.bucket_bits)
        }
        .context("fec ring bucket_bits out of range")?;
        if cfg.clock_rate_hz == 0 {
            bail!("clock_rate_hz must be nonzero");
        }
        let scheduler = Scheduler::new(cfg.scheduler, cfg.clock_rate_hz, cfg.rcc_active);

        Ok(Runtime {
            pcm,
            fec,
            scheduler,
            clock_rate_hz: cfg.clock_rate_hz,
        })
    }

    pub fn pcm(&self) -> &Pcm {
        &self.pcm
    }
    pub fn pcm_mut(&mut self) -> &mut Pcm {
        &mut self.pcm
    }
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
    pub fn clock_rate_hz(&self) -> u32 {
        self.clock_rate_hz
    }

    /// Feed one primary/repair/APP packet in off the wire.
    pub fn insert_media(
        &mut self,
        wire_seq: u16,
        rtp_ts: u32,
        rcv_ts: Instant,
        kind: PacketType,
        payload: Bytes,
    ) -> Result<u32, crate::error::PcmInsertError> {
        let lifted = self.pcm.insert_packet(wire_seq, rtp_ts, rcv_ts, kind, payload)?;
        Ok(lifted)
    }

    /// Feed one FEC parity packet in, buffer it, and attempt recovery of
    /// whichever primaries it protects that are currently missing.
    ///
    /// The parity packet stays buffered in its ring after this call unless
    /// the disposition is terminal (`Ok`/`NotNeeded`/`RtpValidateWrong`/
    /// `PakTooEarly`, all removed immediately). `LatePak`/`Unrecoverable` are
    /// kept for exactly one more `tick`; `FuturePak` is kept and retried every
    /// tick until the range becomes decidable. See `fec::range_disposition`.
    pub fn insert_fec(
        &mut self,
        wire_seq: u16,
        rtp_ts: u32,
        rcv_ts: Instant,
        hdr: FecHeader,
        payload: Bytes,
    ) -> Result<Vec<fec::RecoveredPrimary>, crate::error::FecInsertError> {
        let sn_base32 = self.pcm.lift(hdr.sn_base_low_bits);
        let fec_seq = self.pcm.lift(wire_seq);
        let pak =
            Packet::new(fec_seq, rtp_ts, rcv_ts, PacketType::Fec, payload.clone()).with_fec_header(hdr);

        self.fec.insert(pak, sn_base32)?;
        let (recovered, outcome) = self.attempt_recovery(&hdr, sn_base32, &payload);
        self.apply_disposition(hdr.axis, fec_seq, outcome);
        Ok(recovered)
    }

    fn attempt_recovery(
        &mut self,
        hdr: &FecHeader,
        sn_base32: u32,
        fec_payload: &Bytes,
    ) -> (Vec<fec::RecoveredPrimary>, FecDecError) {
        let (_, d) = self.fec.l_d();
        if let Some(disposition) =
            fec::range_disposition(self.pcm.head(), self.pcm.tail(), sn_base32, hdr.offset, hdr.na_bits, hdr.l(), d)
        {
            return (Vec::new(), disposition);
        }

        let missing = fec::find_missing(self.pcm.bitmap(), sn_base32, hdr.offset, hdr.na_bits);
        let protected = fec::protected_seqs(sn_base32, hdr.offset, hdr.na_bits);
        let present_owned: Vec<Packet> = protected
            .iter()
            .filter(|s| !missing.contains(s))
            .filter_map(|s| self.pcm.peek(*s).cloned())
            .collect();
        let present: Vec<&Packet> = present_owned.iter().collect();

        match fec::decode_one(hdr, fec_payload, &missing, &present) {
            Ok(recovered) => (vec![recovered], FecDecError::Ok),
            Err(e) => (Vec::new(), e),
        }
    }

    /// Gate ring removal on the decode disposition: terminal outcomes are
    /// dropped now, `LatePak`/`Unrecoverable` get one more touch before
    /// dropping, `FuturePak` is left alone entirely.
    fn apply_disposition(&mut self, axis: FecAxis, seq: u32, outcome: FecDecError) {
        if matches!(outcome, FecDecError::FuturePak) {
            return;
        }
        let ring = match axis {
            FecAxis::Column => &mut self.fec.column,
            FecAxis::Row => match self.fec.row.as_mut() {
                Some(row) => row,
                None => return,
            },
        };
        if outcome.retains_for_one_more_tick() {
            if let Some(touched) = ring.bump_touch(seq) {
                if touched >= 2 {
                    ring.remove(seq);
                }
            }
        } else {
            ring.remove(seq);
        }
    }

    /// Re-attempt decode for every currently-buffered FEC packet. Called once
    /// per `tick` before the scheduler emits, so a packet that was
    /// `FuturePak`/`LatePak`/`Unrecoverable` on arrival gets another chance
    /// now that more primaries may have landed.
    fn retry_buffered_fec(&mut self) -> Vec<fec::RecoveredPrimary> {
        let mut recovered_all = Vec::new();
        for axis in [FecAxis::Column, FecAxis::Row] {
            let seqs = match axis {
                FecAxis::Column => self.fec.column.buffered_seqs(),
                FecAxis::Row => self.fec.row.as_ref().map(|r| r.buffered_seqs()).unwrap_or_default(),
            };
            for seq in seqs {
                let hdr_payload = {
                    let found = match axis {
                        FecAxis::Column => self.fec.column.find(seq),
                        FecAxis::Row => self.fec.row.as_ref().and_then(|r| r.find(seq)),
                    };
                    found.map(|p| (p.fec_hdr, p.payload.clone()))
                };
                let Some((Some(hdr), payload)) = hdr_payload else {
                    continue;
                };
                let sn_base32 = self.pcm.lift(hdr.sn_base_low_bits);
                let (recovered, outcome) = self.attempt_recovery(&hdr, sn_base32, &payload);
                self.apply_disposition(axis, seq, outcome);
                recovered_all.extend(recovered);
            }
        }
        recovered_all
    }

    /// Insert an FEC-recovered primary back into the PCM, flagged `AFTER_EC`.
    pub fn insert_recovered(&mut self, recovered: fec::RecoveredPrimary, rcv_ts: Instant) {
        let seq16 = (recovered.seq_num & 0xFFFF) as u16;
        if let Ok(seq) = self.pcm.insert_packet(
            seq16,
            recovered.rtp_ts,
            rcv_ts,
            PacketType::Repair,
            recovered.payload,
        ) {
            self.pcm.mark_after_ec(seq);
        }
    }

    /// Total FEC packets currently buffered across both rings, for tests that
    /// need to observe retention/removal directly.
    pub fn fec_buffered_len(&self) -> u32 {
        self.fec.column.len() + self.fec.row.as_ref().map(|r| r.len()).unwrap_or(0)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Packet> {
        let recovered = self.retry_buffered_fec();
        for r in recovered {
            self.insert_recovered(r, now);
        }
        self.scheduler.tick(&mut self.pcm, now)
    }
}
