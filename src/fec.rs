//! # FEC decoder — Pro-MPEG CoP#3r2 / RFC 2733 XOR FEC
//!
//! Buffers column and (optionally) row FEC packets, learns the head-end's
//! sending order (Annex A vs Annex B) from the spacing of successive
//! `sn_base` values, derives a matrix delay budget from `(L, D, order)`, and
//! XOR-reconstructs a single missing primary per protected set. 2-D mode
//! iterates column then row (then column again) until a pass recovers
//! nothing new.
//!
//! FEC packet buffering lives here (`FecRing`); primary lookup and bitmap
//! gap-checking stay with the PCM, which calls into this module's pure
//! decode functions with the primaries it already owns. This keeps the FEC
//! math independently testable without a PCM instance.
//!
//! `range_disposition` is the error-disposition table: a protected range
//! entirely behind the PCM's head is `LatePak`; one ending more than `2*L*D`
//! past the tail is `PakTooEarly`; within that bound it's `FuturePak` and
//! retried later. Only a range fully inside `[head, tail]` proceeds to
//! `find_missing`/`decode_one`. `runtime.rs` drives the retry and
//! `fec_touched` bookkeeping this table feeds into.

use std::time::Duration;

use crate::bitmap::GapBitmap;
use crate::error::{FecDecError, FecInsertError};
use crate::pakseq::PakSeq;
use crate::packet::Packet;
use crate::seqnum::sub;
use crate::wire::{FecAxis, FecHeader};

pub const MIN_L: u8 = 1;
pub const MAX_L: u8 = 20;
pub const MIN_D: u8 = 4;
pub const MAX_D: u8 = 20;
pub const MAX_LD: u16 = 256;
pub const MIN_L_IN_2D: u8 = 4;
pub const MAX_XOR_CORRECTION: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendingOrder {
    AnnexA,
    AnnexB,
    NotDecided,
}

/// Tracks the last two `(fec_seq, sn_base)` pairs for a given `(L, D)` and
/// decides the sending order once a third arrives. Resets its window
/// whenever `(L, D)` changes underneath it.
#[derive(Debug, Default)]
pub struct OrderDetector {
    saved_l: u8,
    saved_d: u8,
    fst: Option<(u32, u32)>,
    snd: Option<(u32, u32)>,
}

impl OrderDetector {
    pub fn observe(&mut self, fec_seq: u32, sn_base: u32, l: u8, d: u8) -> SendingOrder {
        if l != self.saved_l || d != self.saved_d {
            self.saved_l = l;
            self.saved_d = d;
            self.fst = None;
            self.snd = None;
        }

        let (fst, snd) = match (self.fst, self.snd) {
            (None, _) => {
                self.fst = Some((fec_seq, sn_base));
                return SendingOrder::NotDecided;
            }
            (Some(_), None) => {
                self.snd = Some((fec_seq, sn_base));
                return SendingOrder::NotDecided;
            }
            (Some(fst), Some(snd)) => (fst, snd),
        };

        let diff1 = sub(snd.1, fst.1);
        let diff2 = sub(sn_base, snd.1);
        let l32 = l as i32;
        let d32 = d as i32;

        let order = if diff1 == l32 * d32 - (l32 - 1) || diff2 == l32 * d32 - (l32 - 1) || (diff1 == 1 && diff2 == 1)
        {
            SendingOrder::AnnexB
        } else if diff1 == l32 + 1 || diff2 == l32 + 1 {
            SendingOrder::AnnexA
        } else {
            SendingOrder::NotDecided
        };

        self.fst = self.snd;
        self.snd = Some((fec_seq, sn_base));
        order
    }
}

fn validate_matrix(l: u8, d: u8, two_d: bool) -> Result<(), FecInsertError> {
    if !(MIN_L..=MAX_L).contains(&l) || !(MIN_D..=MAX_D).contains(&d) {
        return Err(FecInsertError::MatrixOutOfRange);
    }
    if (l as u16) * (d as u16) > MAX_LD {
        return Err(FecInsertError::MatrixOutOfRange);
    }
    if two_d && l < MIN_L_IN_2D {
        return Err(FecInsertError::MatrixOutOfRange);
    }
    Ok(())
}

/// The matrix delay factor: time a receiver must buffer before declaring a
/// primary unrecoverable, expressed as a multiple of one packet's transmit
/// time.
pub fn fec_delay_factor(l: u8, d: u8, order: SendingOrder) -> u32 {
    let (l, d) = (l as u32, d as u32);
    match order {
        SendingOrder::AnnexA => l * d + l,
        SendingOrder::AnnexB | SendingOrder::NotDecided => 2 * l * d,
    }
}

/// One axis's buffered FEC packets.
pub struct FecRing {
    ring: PakSeq,
}

impl FecRing {
    pub fn new(bucket_bits: u8) -> Option<Self> {
        Some(FecRing {
            ring: PakSeq::new(bucket_bits)?,
        })
    }

    pub fn insert(&mut self, pak: Packet) -> bool {
        matches!(self.ring.insert(pak).0, crate::pakseq::InsertOutcome::Inserted)
    }

    pub fn remove(&mut self, seq: u32) -> Option<Packet> {
        self.ring.delete(seq)
    }

    pub fn find(&self, seq: u32) -> Option<&Packet> {
        self.ring.find(seq)
    }

    /// Seq numbers of every currently-buffered FEC packet, for per-tick retry.
    pub fn buffered_seqs(&self) -> Vec<u32> {
        self.ring.occupied_seqs()
    }

    /// Bump a buffered packet's `fec_touched` counter and return the new
    /// value, or `None` if it's no longer buffered.
    pub fn bump_touch(&mut self, seq: u32) -> Option<u8> {
        let mut pak = self.ring.delete(seq)?;
        pak.fec_touched = pak.fec_touched.saturating_add(1);
        let touched = pak.fec_touched;
        let (outcome, leftover) = self.ring.insert(pak);
        debug_assert_eq!(outcome, crate::pakseq::InsertOutcome::Inserted);
        debug_assert!(leftover.is_none());
        Some(touched)
    }

    pub fn len(&self) -> u32 {
        self.ring.num_paks()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&mut self) -> u32 {
        self.ring.flush()
    }
}

/// Buffers FEC packets for one channel and tracks the learned matrix
/// parameters. Decode itself is performed by the free functions below,
/// called by the PCM with the primaries it has on hand.
pub struct FecDecoder {
    pub column: FecRing,
    pub row: Option<FecRing>,
    detector: OrderDetector,
    l: u8,
    d: u8,
    order: SendingOrder,
    fec_delay: Duration,
    avg_pkt_time: Duration,
    ts_calculation_done: bool,
}

impl FecDecoder {
    pub fn new_1d(bucket_bits: u8) -> Option<Self> {
        Some(FecDecoder {
            column: FecRing::new(bucket_bits)?,
            row: None,
            detector: OrderDetector::default(),
            l: 0,
            d: 0,
            order: SendingOrder::NotDecided,
            fec_delay: Duration::ZERO,
            avg_pkt_time: Duration::ZERO,
            ts_calculation_done: false,
        })
    }

    pub fn new_2d(bucket_bits: u8) -> Option<Self> {
        let mut dec = Self::new_1d(bucket_bits)?;
        dec.row = Some(FecRing::new(bucket_bits)?);
        Some(dec)
    }

    pub fn order(&self) -> SendingOrder {
        self.order
    }

    pub fn l_d(&self) -> (u8, u8) {
        (self.l, self.d)
    }

    pub fn fec_delay(&self) -> Duration {
        self.fec_delay
    }

    /// Record a freshly-measured average packet transmit time. Used to
    /// recompute `fec_delay` once `(L, D, order)` is known.
    pub fn set_avg_pkt_time(&mut self, t: Duration) {
        self.avg_pkt_time = t;
        self.ts_calculation_done = true;
        self.recompute_fec_delay();
    }

    fn recompute_fec_delay(&mut self) {
        if matches!(self.order, SendingOrder::NotDecided) || !self.ts_calculation_done {
            return;
        }
        let factor = fec_delay_factor(self.l, self.d, self.order);
        let candidate = self.avg_pkt_time * factor;
        // Open Question #2: fec_delay is a shrink-only ceiling — a freshly
        // learned value only takes effect if it would not grow the delay.
        if self.fec_delay == Duration::ZERO || candidate <= self.fec_delay {
            self.fec_delay = candidate;
        }
    }

    /// Validate and buffer one FEC packet. `sn_base32` is the header's
    /// `sn_base_low_bits` already lifted to 32-bit sequence space.
    pub fn insert(&mut self, pak: Packet, sn_base32: u32) -> Result<(), FecInsertError> {
        let hdr = pak.fec_hdr.as_ref().ok_or(FecInsertError::Rejected)?;
        let (l, d) = (hdr.l(), hdr.d());
        if let Err(e) = validate_matrix(l, d, self.row.is_some()) {
            tracing::warn!(l, d, "fec matrix out of range, rejecting packet");
            return Err(e);
        }

        if (l, d) != (self.l, self.d) {
            self.l = l;
            self.d = d;
            self.detector = OrderDetector::default();
        }

        let order = self.detector.observe(pak.seq_num, sn_base32, l, d);
        if !matches!(order, SendingOrder::NotDecided) && order != self.order {
            tracing::debug!(?order, l, d, "fec sending order decided");
            self.order = order;
            self.recompute_fec_delay();
        }

        let axis = hdr.axis;
        let ring = match axis {
            FecAxis::Column => &mut self.column,
            FecAxis::Row => self.row.as_mut().ok_or(FecInsertError::Rejected)?,
        };
        if ring.insert(pak) {
            Ok(())
        } else {
            Err(FecInsertError::Rejected)
        }
    }
}

/// Where a FEC packet's protected range sits relative to the PCM's current
/// `[head, tail]` window. `None` means the range is fully inside the window
/// and the caller should proceed to a `find_missing`/`decode_one` attempt;
/// `Some(_)` is a terminal or retry disposition that skips that attempt.
///
/// `head`/`tail` are `None` when the PCM is empty (nothing to compare
/// against yet) — treated as `FuturePak` so the packet is retried once a
/// primary arrives rather than declared hopeless on no evidence.
pub fn range_disposition(
    head: Option<u32>,
    tail: Option<u32>,
    sn_base32: u32,
    offset: u8,
    na_bits: u8,
    l: u8,
    d: u8,
) -> Option<FecDecError> {
    let protected_end = sn_base32.wrapping_add((na_bits.saturating_sub(1)) as u32 * offset as u32);
    let (head, tail) = match (head, tail) {
        (Some(h), Some(t)) => (h, t),
        _ => return Some(FecDecError::FuturePak),
    };
    if sub(protected_end, head) < 0 {
        return Some(FecDecError::LatePak);
    }
    if sub(protected_end, tail) > 0 {
        let over = sub(protected_end, tail) as u32;
        let bound = 2u32 * l as u32 * (d.max(1)) as u32;
        return Some(if over > bound {
            FecDecError::PakTooEarly
        } else {
            FecDecError::FuturePak
        });
    }
    None
}

/// The set of 32-bit lifted sequence numbers one FEC packet protects.
pub fn protected_seqs(sn_base32: u32, offset: u8, na_bits: u8) -> Vec<u32> {
    (0..na_bits as u32)
        .map(|k| sn_base32.wrapping_add(k * offset as u32))
        .collect()
}

/// Which of a FEC packet's protected primaries are missing, via the bitmap's
/// strided search.
pub fn find_missing(bitmap: &GapBitmap, sn_base32: u32, offset: u8, na_bits: u8) -> Vec<u32> {
    bitmap.strided_search(sn_base32, offset as u32, na_bits as u32)
}

#[derive(Debug, Clone)]
pub struct RecoveredPrimary {
    pub seq_num: u32,
    pub rtp_ts: u32,
    pub payload: bytes::Bytes,
}

fn xor_into(acc: &mut Vec<u8>, other: &[u8]) {
    if other.len() > acc.len() {
        acc.resize(other.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

/// XOR-reconstruct the one missing primary protected by `fec_hdr`/`fec_payload`
/// given every *other* protected primary that is present. `missing_seq` is
/// the already-identified gap (from `find_missing`) and becomes the
/// recovered packet's sequence number.
///
/// The header fields actually reconstructed here are the first 8 bytes of
/// the RTP header (version/marker/PT byte, sequence, timestamp) — SSRC is
/// not XOR-recovered and must be copied from a present primary by the
/// caller, matching the source's treatment of SSRC as a per-flow constant
/// rather than a per-packet recoverable field.
pub fn recover(
    fec_hdr: &FecHeader,
    fec_payload: &[u8],
    missing_seq: u32,
    present: &[&Packet],
) -> Result<RecoveredPrimary, FecDecError> {
    let mut acc: Vec<u8> = fec_payload.to_vec();
    let mut recovered_len = fec_hdr.length_recovery as i32;
    for p in present {
        xor_into(&mut acc, &p.payload);
        recovered_len ^= (p.payload.len() as i32) & 0xFFFF;
    }
    let recovered_len = (recovered_len as u16) as usize;

    if acc.len() < 8 || recovered_len < 8 || recovered_len > acc.len() {
        return Err(FecDecError::RtpValidateWrong);
    }
    acc.truncate(recovered_len);

    // Overwrite the version bits with the RTP v2 constant (0b10).
    acc[0] = (acc[0] & 0x3F) | 0x80;
    if acc[0] >> 6 != 2 {
        return Err(FecDecError::RtpValidateWrong);
    }

    // Overwrite the recovered 16-bit sequence field with the seq we already
    // identified via the bitmap's strided search.
    let seq_lo = (missing_seq & 0xFFFF) as u16;
    acc[2..4].copy_from_slice(&seq_lo.to_be_bytes());
    let rtp_ts = u32::from_be_bytes([acc[4], acc[5], acc[6], acc[7]]);

    Ok(RecoveredPrimary {
        seq_num: missing_seq,
        rtp_ts,
        payload: bytes::Bytes::from(acc),
    })
}

/// Apply the full error-disposition decision for one FEC packet's protected
/// set: how many are missing, and if exactly one, attempt recovery.
pub fn decode_one(
    fec_hdr: &FecHeader,
    fec_payload: &[u8],
    missing: &[u32],
    present: &[&Packet],
) -> Result<RecoveredPrimary, FecDecError> {
    if missing.is_empty() {
        return Err(FecDecError::NotNeeded);
    }
    if missing.len() > MAX_XOR_CORRECTION {
        return Err(FecDecError::Unrecoverable);
    }
    recover(fec_hdr, fec_payload, missing[0], present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::Bytes;
    use quanta::Instant;

    fn rtp_like(seq: u16, ts: u32, media: &[u8]) -> Vec<u8> {
        let mut v = vec![0x80, 96, 0, 0, 0, 0, 0, 0];
        v[2..4].copy_from_slice(&seq.to_be_bytes());
        v[4..8].copy_from_slice(&ts.to_be_bytes());
        v.extend_from_slice(media);
        v
    }

    fn pak(seq: u32, bytes_: Vec<u8>) -> Packet {
        Packet::new(seq, 0, Instant::now(), PacketType::Primary, Bytes::from(bytes_))
    }

    #[test]
    fn order_detector_recognizes_annex_b() {
        let mut det = OrderDetector::default();
        // L=5, D=4: Annex B spacing is L*D-(L-1) = 20-4 = 16.
        assert_eq!(det.observe(0, 0, 5, 4), SendingOrder::NotDecided);
        assert_eq!(det.observe(1, 16, 5, 4), SendingOrder::NotDecided);
        assert_eq!(det.observe(2, 32, 5, 4), SendingOrder::AnnexB);
    }

    #[test]
    fn order_detector_recognizes_annex_a() {
        let mut det = OrderDetector::default();
        // Annex A spacing is L+1 = 6.
        assert_eq!(det.observe(0, 0, 5, 4), SendingOrder::NotDecided);
        assert_eq!(det.observe(1, 6, 5, 4), SendingOrder::NotDecided);
        assert_eq!(det.observe(2, 12, 5, 4), SendingOrder::AnnexA);
    }

    #[test]
    fn order_detector_resets_on_ld_change() {
        let mut det = OrderDetector::default();
        det.observe(0, 0, 5, 4);
        det.observe(1, 16, 5, 4);
        // L/D changed: window must restart, not spuriously decide.
        assert_eq!(det.observe(2, 32, 3, 4), SendingOrder::NotDecided);
    }

    #[test]
    fn recover_single_missing_primary() {
        let p0 = rtp_like(100, 9000, b"aaaa");
        let p1 = rtp_like(101, 9010, b"bbbb");
        let p2 = rtp_like(102, 9020, b"cccc");

        // FEC payload = XOR of all three protected primaries.
        let mut fec_payload = vec![0u8; p0.len().max(p1.len()).max(p2.len())];
        for p in [&p0, &p1, &p2] {
            xor_into(&mut fec_payload, p);
        }

        let fec_hdr = FecHeader {
            sn_base_low_bits: 100,
            length_recovery: (p0.len() as u16) ^ (p1.len() as u16) ^ (p2.len() as u16),
            pt_recovery: 96,
            ts_recovery: 9000 ^ 9010 ^ 9020,
            axis: FecAxis::Row,
            offset: 1,
            na_bits: 3,
        };

        // p1 is missing; p0 and p2 are present.
        let present0 = pak(100, p0.clone());
        let present2 = pak(102, p2.clone());
        let present: Vec<&Packet> = vec![&present0, &present2];

        let recovered = recover(&fec_hdr, &fec_payload, 101, &present).unwrap();
        assert_eq!(recovered.seq_num, 101);
        assert_eq!(recovered.rtp_ts, 9010);
        assert_eq!(recovered.payload.as_ref(), p1.as_slice());
    }

    #[test]
    fn decode_one_reports_not_needed_when_nothing_missing() {
        let fec_hdr = FecHeader {
            sn_base_low_bits: 0,
            length_recovery: 0,
            pt_recovery: 96,
            ts_recovery: 0,
            axis: FecAxis::Column,
            offset: 1,
            na_bits: 1,
        };
        let err = decode_one(&fec_hdr, &[], &[], &[]).unwrap_err();
        assert_eq!(err, FecDecError::NotNeeded);
    }

    #[test]
    fn decode_one_reports_unrecoverable_when_two_missing() {
        let fec_hdr = FecHeader {
            sn_base_low_bits: 0,
            length_recovery: 0,
            pt_recovery: 96,
            ts_recovery: 0,
            axis: FecAxis::Column,
            offset: 1,
            na_bits: 3,
        };
        let err = decode_one(&fec_hdr, &[], &[10, 11], &[]).unwrap_err();
        assert_eq!(err, FecDecError::Unrecoverable);
    }

    #[test]
    fn matrix_validation_rejects_out_of_range() {
        assert!(validate_matrix(0, 4, false).is_err());
        assert!(validate_matrix(21, 4, false).is_err());
        assert!(validate_matrix(5, 3, false).is_err());
        assert!(validate_matrix(20, 20, false).is_err()); // 400 > MAX_LD
        assert!(validate_matrix(3, 4, true).is_err()); // below MIN_L_IN_2D
        assert!(validate_matrix(5, 4, false).is_ok());
    }

    #[test]
    fn range_disposition_empty_pcm_is_future() {
        assert_eq!(range_disposition(None, None, 0, 1, 3, 3, 4), Some(FecDecError::FuturePak));
    }

    #[test]
    fn range_disposition_entirely_behind_head_is_late() {
        // protected range [0, 2]; head has already moved past it.
        assert_eq!(
            range_disposition(Some(10), Some(20), 0, 1, 3, 3, 4),
            Some(FecDecError::LatePak)
        );
    }

    #[test]
    fn range_disposition_within_bound_past_tail_is_future() {
        // protected range [0, 2]; tail is only at 0, but 2 is within 2*L*D of it.
        assert_eq!(
            range_disposition(Some(0), Some(0), 0, 1, 3, 3, 4),
            Some(FecDecError::FuturePak)
        );
    }

    #[test]
    fn range_disposition_far_past_tail_is_too_early() {
        // protected range [0, 2]; tail is at 0, bound is 2*L*D = 2*3*1 = 6 with D clamped to 1.
        assert_eq!(
            range_disposition(Some(0), Some(0), 0, 1, 3, 3, 1),
            Some(FecDecError::FuturePak)
        );
        assert_eq!(
            range_disposition(Some(0), Some(0), 100, 1, 3, 3, 1),
            Some(FecDecError::PakTooEarly)
        );
    }

    #[test]
    fn range_disposition_inside_window_defers_to_missing_check() {
        // protected range [0, 2] entirely within [head=0, tail=2].
        assert_eq!(range_disposition(Some(0), Some(2), 0, 1, 3, 3, 4), None);
    }

    #[test]
    fn fec_delay_only_shrinks() {
        let mut dec = FecDecoder::new_1d(8).unwrap();
        dec.l = 5;
        dec.d = 4;
        dec.order = SendingOrder::AnnexA;
        dec.set_avg_pkt_time(Duration::from_millis(10));
        let first = dec.fec_delay();
        assert!(first > Duration::ZERO);

        // A larger learned value must not grow fec_delay.
        dec.set_avg_pkt_time(Duration::from_millis(50));
        assert_eq!(dec.fec_delay(), first);

        // A smaller learned value is allowed to shrink it.
        dec.set_avg_pkt_time(Duration::from_millis(1));
        assert!(dec.fec_delay() < first);
    }
}
