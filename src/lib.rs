//! # vqe-repair-core
//!
//! Receiver-side packet repair core for an RTP video client: a sequence-
//! indexed packet cache, a Pro-MPEG CoP#3r2 / RFC 2733 XOR FEC decoder, and
//! an output scheduler with non-linear-loop (NLL) timing recovery and RCC
//! (rapid channel change) burst handling.
//!
//! ## Crate structure
//!
//! - [`seqnum`] — 16-to-32-bit sequence number lifting and signed comparison
//! - [`bitmap`] — gap bitmap: presence tracking, gap-run enumeration, strided search
//! - [`packet`] — the `Packet` entity, `PacketType`/`PacketFlags`, bounded pool
//! - [`pakseq`] — bucket-indexed packet ring (collision-vs-duplicate insert)
//! - [`wire`] — Pro-MPEG CoP#3r2 FEC header wire format
//! - [`fec`] — FEC decoder: header learning, XOR reconstruction, 2-D iteration
//! - [`tr135`] — TR-135 loss-event state machine and ring statistics
//! - [`pcm`] — Packet Cache Manager: insert/remove/gap-report/candidate array
//! - [`nll`] — RTP-timestamp to wall-clock mapping (tracking/non-tracking)
//! - [`scheduler`] — output scheduler state machine (RccApp/RccRepair/Normal)
//! - [`error`] — per-subsystem error enums
//! - [`config`] — `PcmConfig`/`FecConfig`/`SchedulerConfig`
//! - [`runtime`] — `Runtime` handle bundling one channel's PCM/FEC/scheduler

pub mod bitmap;
pub mod config;
pub mod error;
pub mod fec;
pub mod nll;
pub mod pakseq;
pub mod packet;
pub mod pcm;
pub mod runtime;
pub mod scheduler;
pub mod seqnum;
pub mod tr135;
pub mod wire;
