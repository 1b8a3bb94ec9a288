//! # `pak_seq` — bucket-indexed packet ring
//!
//! A fixed-size, power-of-two array of `(seq_num, Packet)` slots. A packet's
//! bucket is `seq_num & bucket_mask`; there is no chaining and no probing —
//! a bucket holds at most one packet at a time, and insertion never
//! overwrites an occupant, whether the occupant is the same seq (a true
//! duplicate) or a different one (a bucket collision, meaning the caller let
//! the ring grow stale enough to wrap onto itself).
//!
//! Empty buckets carry a sentinel seq number that no real packet can ever
//! hash to, so `find`/`delete` on an empty bucket reliably miss rather than
//! false-matching seq 0.

use crate::packet::Packet;

/// `bucket=0` reserves sentinel `1`, every other bucket reserves sentinel
/// `0` — either way, a seq number that actually hashes to that bucket can
/// never equal it (seq 0 hashes to bucket 0, never to a nonzero bucket).
#[inline]
fn invalid_seq_for_bucket(bucket: u32) -> u32 {
    if bucket == 0 {
        1
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same seq number already occupied the bucket.
    Duplicate,
    /// A different seq number occupies the bucket the new packet hashed to.
    Collision,
}

struct Bucket {
    seq_num: u32,
    pak: Option<Packet>,
}

/// A bucket-indexed ring of in-flight packets, sized to a power of two.
pub struct PakSeq {
    bucket_mask: u32,
    buckets: Vec<Bucket>,
    num_paks: u32,
    num_dups: u32,
}

impl PakSeq {
    /// `bucket_bits` must be in `1..=16` (mirrors the source's
    /// `VQEC_PAK_SEQ_MAX_BUCKET_BITS`).
    pub fn new(bucket_bits: u8) -> Option<Self> {
        if bucket_bits == 0 || bucket_bits > 16 {
            return None;
        }
        let num_buckets = 1u32 << bucket_bits;
        let buckets = (0..num_buckets)
            .map(|b| Bucket {
                seq_num: invalid_seq_for_bucket(b),
                pak: None,
            })
            .collect();
        Some(PakSeq {
            bucket_mask: num_buckets - 1,
            buckets,
            num_paks: 0,
            num_dups: 0,
        })
    }

    #[inline]
    pub fn find_bucket(&self, seq_num: u32) -> u32 {
        seq_num & self.bucket_mask
    }

    pub fn num_buckets(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn num_paks(&self) -> u32 {
        self.num_paks
    }

    pub fn num_dups(&self) -> u32 {
        self.num_dups
    }

    /// Insert `pak`. Never overwrites an occupied bucket — the caller gets
    /// the packet back in `Duplicate`/`Collision` cases so it can dispose of
    /// it (update stats, drop it) without this module owning disposal
    /// policy.
    pub fn insert(&mut self, pak: Packet) -> (InsertOutcome, Option<Packet>) {
        let bucket_num = self.find_bucket(pak.seq_num) as usize;
        let bucket = &mut self.buckets[bucket_num];

        if bucket.pak.is_some() {
            if bucket.seq_num == pak.seq_num {
                self.num_dups += 1;
                (InsertOutcome::Duplicate, Some(pak))
            } else {
                (InsertOutcome::Collision, Some(pak))
            }
        } else {
            bucket.seq_num = pak.seq_num;
            bucket.pak = Some(pak);
            self.num_paks += 1;
            (InsertOutcome::Inserted, None)
        }
    }

    pub fn find(&self, seq_num: u32) -> Option<&Packet> {
        let bucket_num = self.find_bucket(seq_num) as usize;
        let bucket = &self.buckets[bucket_num];
        if bucket.seq_num == seq_num {
            bucket.pak.as_ref()
        } else {
            None
        }
    }

    /// Remove and return the packet at `seq_num`, if present.
    pub fn delete(&mut self, seq_num: u32) -> Option<Packet> {
        let bucket_num = self.find_bucket(seq_num) as usize;
        let bucket = &mut self.buckets[bucket_num];
        if bucket.seq_num == seq_num {
            let pak = bucket.pak.take();
            bucket.seq_num = invalid_seq_for_bucket(bucket_num as u32);
            if pak.is_some() {
                self.num_paks -= 1;
            }
            pak
        } else {
            None
        }
    }

    /// Seq numbers of every currently-occupied bucket, in bucket order.
    pub fn occupied_seqs(&self) -> Vec<u32> {
        self.buckets
            .iter()
            .filter(|b| b.pak.is_some())
            .map(|b| b.seq_num)
            .collect()
    }

    /// Drop every occupied bucket, resetting sentinels. Returns the count of
    /// packets removed.
    pub fn flush(&mut self) -> u32 {
        let removed = self.num_paks;
        for (bucket_num, bucket) in self.buckets.iter_mut().enumerate() {
            bucket.pak = None;
            bucket.seq_num = invalid_seq_for_bucket(bucket_num as u32);
        }
        self.num_paks = 0;
        removed
    }
}
