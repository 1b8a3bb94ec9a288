use bytes::Bytes;
use quanta::Instant;
use vqe_repair_core::config::PcmConfig;
use vqe_repair_core::packet::{PacketFlags, PacketType};
use vqe_repair_core::pcm::{GapRecord, Pcm};
use vqe_repair_core::tr135::Tr135Params;

fn fresh_pcm() -> Pcm {
    Pcm::new(PcmConfig::default(), 10, Tr135Params::default()).unwrap()
}

#[test]
fn head_and_tail_track_the_widening_range() {
    let mut pcm = fresh_pcm();
    let now = Instant::now();
    pcm.insert_packet(100, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    let tail = pcm.insert_packet(110, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    let head = pcm.insert_packet(90, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    assert_eq!(pcm.head(), Some(head));
    assert_eq!(pcm.tail(), Some(tail));
}

#[test]
fn bitmap_reflects_exactly_the_inserted_and_removed_packets() {
    let mut pcm = fresh_pcm();
    let now = Instant::now();
    let s0 = pcm.insert_packet(1, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    let s1 = pcm.insert_packet(2, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    assert!(pcm.bitmap().get_bit(s0));
    assert!(pcm.bitmap().get_bit(s1));
    pcm.remove_packet(s0);
    assert!(!pcm.bitmap().get_bit(s0));
    assert!(pcm.bitmap().get_bit(s1));
}

#[test]
fn underrun_after_drain_bumps_generation_and_resets_last_pak_seq() {
    let mut pcm = fresh_pcm();
    let now = Instant::now();
    let seq = pcm.insert_packet(5, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    pcm.remove_packet(seq);
    assert_eq!(pcm.last_pak_seq(), Some(seq));

    // Ring is now empty; the next insert observes the under-run condition.
    let next = pcm.insert_packet(6, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    assert_eq!(pcm.ring_stats().underruns, 1);
    assert!(pcm.last_pak_seq().is_none() || pcm.last_pak_seq() != Some(seq));
    assert_ne!(next, seq + 1, "the bumped generation must not land contiguously with the pre-underrun seq");
}

#[test]
fn primary_arriving_after_after_ec_repair_clears_the_flag_in_place() {
    let mut pcm = fresh_pcm();
    let now = Instant::now();
    let seq = pcm.insert_packet(7, 0, now, PacketType::Repair, Bytes::new()).unwrap();
    pcm.mark_after_ec(seq);
    assert!(pcm.peek(seq).unwrap().flags.is_set(PacketFlags::AFTER_EC));

    let result = pcm.insert_packet(7, 0, now, PacketType::Primary, Bytes::new());
    assert!(result.is_ok(), "confirming primary must not be rejected as a plain duplicate");
    assert!(!pcm.peek(seq).unwrap().flags.is_set(PacketFlags::AFTER_EC));
}

#[test]
fn get_gaps_paginates_across_multiple_calls_when_buffer_is_small() {
    let mut pcm = fresh_pcm();
    let now = Instant::now();
    // Three separate single-seq gaps between widely spaced primaries.
    for wire in [0u16, 10, 20, 30] {
        pcm.insert_packet(wire, 0, now, PacketType::Primary, Bytes::new()).unwrap();
    }
    let tail = pcm.tail().unwrap();
    // Bypass the candidate-aging path for this test: make everything eligible
    // up front via the public RCC hook, then paginate through a 1-slot buffer.
    pcm.notify_rcc_en_er();
    let mut total_runs = 0;
    let mut buf = [GapRecord { start_seq: 0, extent: 0 }; 1];
    loop {
        let (count, more) = pcm.get_gaps(&mut buf);
        total_runs += count;
        if !more {
            break;
        }
    }
    assert!(total_runs >= 3, "expected at least 3 disjoint gap runs, got {total_runs}");
    let _ = tail;
}
