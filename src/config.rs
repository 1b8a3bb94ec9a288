//! # Configuration
//!
//! Plain, `serde`-derived config structs, following the teacher's own
//! `stats.rs` style of small `Default`-able structs rather than a builder.
//! These are typically populated from a control-plane message and then held
//! for the lifetime of a session; see `runtime.rs` for how they're threaded
//! through to the PCM/FEC/scheduler triad.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters the PCM needs at construction and during steady-state
/// operation. `configured_delay` and `app_replication_delay` come from
/// session signalling; the rest are local tuning knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PcmConfig {
    /// Early-retransmission (error repair) requests are generated.
    pub er_enabled: bool,
    /// Rapid Channel Change burst is in progress or expected.
    pub rcc_enabled: bool,
    /// Gap bitmap span, in sequence numbers. Must fit `bitmap::MIN_SIZE..=MAX_SIZE`.
    pub bitmap_size: u32,
    /// Fixed jitter-buffer delay budget, independent of FEC.
    pub configured_delay: Duration,
    /// Per-APP-packet replication delay charged cumulatively during an RCC burst.
    pub app_replication_delay: Duration,
    /// Maximum allowed `|seq - head|` / `|seq - tail|` before a packet is
    /// rejected as out of range.
    pub max_gap: u32,
    /// Number of buckets in the candidate aging array.
    pub candidate_array_len: usize,
    /// Base reorder-wait component of `gap_hold_time` (the other component
    /// is the FEC decoder's learned `fec_delay`).
    pub reorder_delay: Duration,
}

impl Default for PcmConfig {
    fn default() -> Self {
        PcmConfig {
            er_enabled: true,
            rcc_enabled: false,
            bitmap_size: 8192,
            configured_delay: Duration::from_millis(200),
            app_replication_delay: Duration::from_millis(20),
            max_gap: 4096,
            candidate_array_len: 32,
            reorder_delay: Duration::from_millis(50),
        }
    }
}

/// Parameters for the FEC decoder beyond what's learned from headers
/// (`L`, `D`, sending order) — see `fec::FecDecoder::new_1d`/`new_2d`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FecConfig {
    pub two_d: bool,
    /// Bucket-bits sizing the column/row `pak_seq` rings.
    pub bucket_bits: u8,
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            two_d: false,
            bucket_bits: 9,
        }
    }
}

/// Output-scheduler tuning: how long to hold a fresh stream before the first
/// emission (minimum backfill), and RCC fastfill behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub min_backfill: Duration,
    /// Enable the memory-optimized fastfill burst at RCC join.
    pub fastfill_enabled: bool,
    /// Cap on how far ahead of real time fastfill is allowed to emit.
    pub fastfill_max_advance: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            min_backfill: Duration::from_millis(100),
            fastfill_enabled: false,
            fastfill_max_advance: Duration::from_millis(500),
        }
    }
}
