//! # Packet entity and bounded pool
//!
//! A `Packet` is a buffer plus the metadata the rest of the core needs to
//! place it in `pak_seq`, schedule it, and update statistics. Ownership is
//! single-owner: a `Packet` moves into `pak_seq` on insert and moves back out
//! on remove, rather than being refcounted (see DESIGN.md, "Manual
//! refcounting").
//!
//! Admission is gated by `PacketPool`, a bounded counter rather than a real
//! slab allocator — there is nothing to hand back a handle to, since the
//! packet itself is the owned value.

use bytes::Bytes;
use quanta::Instant;
use std::time::Duration;

use crate::wire::FecHeader;

// ─── PacketType ──────────────────────────────────────────────────────────────

/// Classification of a packet as it enters the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Primary media packet.
    Primary,
    /// A retransmitted or FEC-recovered repair of a primary.
    Repair,
    /// Column or row FEC parity packet.
    Fec,
    /// Auxiliary Pre-Position packet, replicated during an RCC burst.
    App,
}

// ─── PacketFlags ─────────────────────────────────────────────────────────────

/// Per-packet flag bits. Hand-rolled rather than pulled from a bitflags
/// crate — four bits, checked and set individually, never combined in bulk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const REORDERED: u8 = 1 << 0;
    pub const DISCONTINUITY: u8 = 1 << 1;
    pub const AFTER_EC: u8 = 1 << 2;
    pub const ON_INORDER_QUEUE: u8 = 1 << 3;

    #[inline]
    pub fn empty() -> Self {
        PacketFlags(0)
    }

    #[inline]
    pub fn is_set(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    #[inline]
    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

// ─── Packet ───────────────────────────────────────────────────────────────────

/// A packet moving through the repair core.
#[derive(Debug, Clone)]
pub struct Packet {
    /// 32-bit lifted sequence number (see `seqnum`).
    pub seq_num: u32,
    /// RTP timestamp carried on the wire (PCR/90kHz units, per stream).
    pub rtp_ts: u32,
    /// Time this packet was received, used as the NLL's `rcv_ts` sample.
    pub rcv_ts: Instant,
    /// Predicted play-out time, filled in by the scheduler just before the
    /// packet becomes `pak_pend`.
    pub pred_ts: Option<Instant>,
    pub kind: PacketType,
    pub flags: PacketFlags,
    /// Opaque media payload (primary/repair) or FEC parity payload.
    pub payload: Bytes,
    /// Parsed FEC header, set only for `PacketType::Fec` packets.
    pub fec_hdr: Option<FecHeader>,
    /// Cumulative APP replication delay inherited from preceding APP packets.
    pub app_cpy_delay: Duration,
    /// Number of times FEC has looked at this packet without success.
    pub fec_touched: u8,
}

impl Packet {
    pub fn new(seq_num: u32, rtp_ts: u32, rcv_ts: Instant, kind: PacketType, payload: Bytes) -> Self {
        Packet {
            seq_num,
            rtp_ts,
            rcv_ts,
            pred_ts: None,
            kind,
            flags: PacketFlags::empty(),
            payload,
            fec_hdr: None,
            app_cpy_delay: Duration::ZERO,
            fec_touched: 0,
        }
    }

    pub fn with_fec_header(mut self, hdr: FecHeader) -> Self {
        self.fec_hdr = Some(hdr);
        self
    }
}

// ─── PacketPool ──────────────────────────────────────────────────────────────

/// Bounded admission control. `acquire` returns `false` (NoMem) once
/// `capacity` packets are outstanding; `release` must be called exactly once
/// per successful `acquire` when the packet leaves the core (removed from
/// `pak_seq`, dropped on flush, or rejected after acquisition).
#[derive(Debug)]
pub struct PacketPool {
    capacity: usize,
    in_use: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        PacketPool { capacity, in_use: 0 }
    }

    /// Attempt to admit one packet. Returns `false` if the pool is full.
    pub fn acquire(&mut self) -> bool {
        if self.in_use >= self.capacity {
            false
        } else {
            self.in_use += 1;
            true
        }
    }

    /// Release one previously acquired packet back to the pool.
    pub fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.in_use >= self.capacity
    }
}
