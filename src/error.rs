//! Per-subsystem error enums. Kept small and total rather than reaching for
//! an error-derive crate — every variant here is a disposition the caller is
//! expected to match on, not a string to print and forget.

use std::fmt;

pub use crate::bitmap::BitmapError;
pub use crate::wire::FecHeaderError;

/// Outcome of offering a primary/repair/APP packet to the PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmInsertError {
    /// Packet pool was at capacity; caller must drop the packet.
    NoMemory,
    /// Already present in `pak_seq` at this seq number.
    Duplicate,
    /// Seq number is behind `head` and outside the reorder window.
    TooLate,
    /// Seq number would push `tail - head` past the configured spread.
    OutOfRange,
}

impl fmt::Display for PcmInsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcmInsertError::NoMemory => write!(f, "packet pool exhausted"),
            PcmInsertError::Duplicate => write!(f, "duplicate sequence number"),
            PcmInsertError::TooLate => write!(f, "sequence number too late"),
            PcmInsertError::OutOfRange => write!(f, "sequence number out of head/tail range"),
        }
    }
}

impl std::error::Error for PcmInsertError {}

/// Outcome of offering a FEC packet to a `FecStream` ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecInsertError {
    Header(FecHeaderError),
    /// `L`/`D` outside `[MIN_L, MAX_L]` / `[MIN_D, MAX_D]`, or `L*D > MAX_LD`.
    MatrixOutOfRange,
    /// Duplicate or collision in the column/row ring.
    Rejected,
}

impl fmt::Display for FecInsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FecInsertError::Header(e) => write!(f, "fec header: {e:?}"),
            FecInsertError::MatrixOutOfRange => write!(f, "L/D matrix dimensions out of range"),
            FecInsertError::Rejected => write!(f, "fec packet rejected by ring"),
        }
    }
}

impl std::error::Error for FecInsertError {}

/// Disposition of a single FEC decode attempt against one protected primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecDecError {
    /// Decode succeeded.
    Ok,
    /// Fewer primaries present than `na_bits - 1`; nothing missing to fix.
    NotNeeded,
    /// More than `MAX_XOR_CORRECTION` primaries missing; cannot solve.
    Unrecoverable,
    /// Protected range ends more than `2*L*D` past the PCM tail; will never
    /// become decidable, drop now.
    PakTooEarly,
    /// Protected range is entirely behind the PCM head; the window has closed.
    LatePak,
    /// Protected range ends past the PCM tail but within `2*L*D`; retry once
    /// more primaries have arrived.
    FuturePak,
    /// Reconstructed RTP header failed validation.
    RtpValidateWrong,
}

impl fmt::Display for FecDecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for FecDecError {}

impl FecDecError {
    /// `LatePak`/`Unrecoverable` are retained for one extra scheduler tick
    /// before being dropped (`fec_touched` accounting). `FuturePak` is also
    /// kept, but untouched and untimed — it retries every tick until the
    /// range becomes `Ok`/`NotNeeded`/`Unrecoverable`/`PakTooEarly`. Everything
    /// else is removed immediately.
    pub fn retains_for_one_more_tick(self) -> bool {
        matches!(self, FecDecError::LatePak | FecDecError::Unrecoverable)
    }
}
