use bytes::{Bytes, BytesMut};
use quanta::Instant;
use vqe_repair_core::config::{FecConfig, PcmConfig};
use vqe_repair_core::packet::PacketType;
use vqe_repair_core::runtime::{Runtime, RuntimeConfig};
use vqe_repair_core::tr135::Tr135Params;
use vqe_repair_core::wire::{FecAxis, FecHeader};

fn rtp_like(seq: u16, ts: u32, media: &[u8]) -> Vec<u8> {
    let mut v = vec![0x80u8, 96, 0, 0, 0, 0, 0, 0];
    v[2..4].copy_from_slice(&seq.to_be_bytes());
    v[4..8].copy_from_slice(&ts.to_be_bytes());
    v.extend_from_slice(media);
    v
}

fn xor_all(parts: &[&[u8]]) -> Vec<u8> {
    let max_len = parts.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut acc = vec![0u8; max_len];
    for p in parts {
        for (a, b) in acc.iter_mut().zip(p.iter()) {
            *a ^= b;
        }
    }
    acc
}

fn runtime(two_d: bool) -> Runtime {
    let cfg = RuntimeConfig {
        pcm: PcmConfig::default(),
        fec: FecConfig { two_d, bucket_bits: 9 },
        scheduler: Default::default(),
        tr135: Tr135Params::default(),
        pcm_bucket_bits: 10,
        clock_rate_hz: 90_000,
        rcc_active: false,
    };
    Runtime::new(cfg).unwrap()
}

#[test]
fn single_missing_primary_is_recovered_from_a_column_fec_packet() {
    let mut rt = runtime(false);
    let now = Instant::now();

    let p0 = rtp_like(0, 0, b"aaaa");
    let p1 = rtp_like(1, 10, b"bbbb");
    let p2 = rtp_like(2, 20, b"cccc");
    let p3 = rtp_like(3, 30, b"dddd");
    let fec_payload = xor_all(&[&p0, &p1, &p2, &p3]);

    rt.insert_media(0, 0, now, PacketType::Primary, Bytes::from(p0.clone())).unwrap();
    // p1 deliberately not inserted -- it's the hole FEC will fill.
    rt.insert_media(2, 20, now, PacketType::Primary, Bytes::from(p2.clone())).unwrap();
    rt.insert_media(3, 30, now, PacketType::Primary, Bytes::from(p3.clone())).unwrap();

    let hdr = FecHeader {
        sn_base_low_bits: 0,
        length_recovery: (p0.len() as u16) ^ (p1.len() as u16) ^ (p2.len() as u16) ^ (p3.len() as u16),
        pt_recovery: 96,
        ts_recovery: 0 ^ 10 ^ 20 ^ 30,
        axis: FecAxis::Column,
        offset: 1,
        na_bits: 4,
    };

    let recovered = rt.insert_fec(1000, 0, now, hdr, Bytes::from(fec_payload)).unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].seq_num, 1);
    assert_eq!(recovered[0].rtp_ts, 10);
    assert_eq!(recovered[0].payload.as_ref(), p1.as_slice());
}

#[test]
fn fec_packet_with_nothing_missing_recovers_nothing() {
    let mut rt = runtime(false);
    let now = Instant::now();

    let p0 = rtp_like(0, 0, b"aaaa");
    let p1 = rtp_like(1, 10, b"bbbb");
    let p2 = rtp_like(2, 20, b"cccc");
    let p3 = rtp_like(3, 30, b"dddd");
    let fec_payload = xor_all(&[&p0, &p1, &p2, &p3]);

    for (wire, ts, p) in [(0u16, 0u32, &p0), (1, 10, &p1), (2, 20, &p2), (3, 30, &p3)] {
        rt.insert_media(wire, ts, now, PacketType::Primary, Bytes::from(p.clone())).unwrap();
    }

    let hdr = FecHeader {
        sn_base_low_bits: 0,
        length_recovery: (p0.len() as u16) ^ (p1.len() as u16) ^ (p2.len() as u16) ^ (p3.len() as u16),
        pt_recovery: 96,
        ts_recovery: 0 ^ 10 ^ 20 ^ 30,
        axis: FecAxis::Column,
        offset: 1,
        na_bits: 4,
    };

    let recovered = rt.insert_fec(1000, 0, now, hdr, Bytes::from(fec_payload)).unwrap();
    assert!(recovered.is_empty());
}

#[test]
fn unrecoverable_fec_packet_is_retained_for_one_extra_tick_then_dropped() {
    let mut rt = runtime(false);
    let now = Instant::now();

    // p1 and p2 both missing -- two holes, cannot be XOR-recovered -- and the
    // tail already covers the whole protected range so the disposition is
    // decidable (not FuturePak).
    rt.insert_media(0, 0, now, PacketType::Primary, Bytes::from(rtp_like(0, 0, b"aaaa")))
        .unwrap();
    rt.insert_media(3, 30, now, PacketType::Primary, Bytes::from(rtp_like(3, 30, b"dddd")))
        .unwrap();

    let hdr = FecHeader {
        sn_base_low_bits: 0,
        length_recovery: 0,
        pt_recovery: 96,
        ts_recovery: 0,
        axis: FecAxis::Column,
        offset: 1,
        na_bits: 4,
    };
    let recovered = rt.insert_fec(1000, 0, now, hdr, BytesMut::zeroed(12).freeze()).unwrap();
    assert!(recovered.is_empty(), "two holes cannot be recovered");
    assert_eq!(rt.fec_buffered_len(), 1, "first touch: still retained");

    rt.tick(now + std::time::Duration::from_millis(20));
    assert_eq!(rt.fec_buffered_len(), 0, "second touch: dropped");
}

#[test]
fn future_fec_packet_is_retried_until_the_tail_catches_up() {
    let mut rt = runtime(false);
    let now = Instant::now();

    let p0 = rtp_like(0, 0, b"aaaa");
    let p1 = rtp_like(1, 10, b"bbbb");
    let p2 = rtp_like(2, 20, b"cccc");
    let p3 = rtp_like(3, 30, b"dddd");
    let fec_payload = xor_all(&[&p0, &p1, &p2, &p3]);

    rt.insert_media(0, 0, now, PacketType::Primary, Bytes::from(p0.clone())).unwrap();
    // Only p0 present so far; tail (0) is far behind the protected range's
    // end (3), so this must come back FuturePak rather than Unrecoverable.
    let hdr = FecHeader {
        sn_base_low_bits: 0,
        length_recovery: (p0.len() as u16) ^ (p1.len() as u16) ^ (p2.len() as u16) ^ (p3.len() as u16),
        pt_recovery: 96,
        ts_recovery: 0 ^ 10 ^ 20 ^ 30,
        axis: FecAxis::Column,
        offset: 1,
        na_bits: 4,
    };
    let recovered = rt.insert_fec(1000, 0, now, hdr, Bytes::from(fec_payload)).unwrap();
    assert!(recovered.is_empty());
    assert_eq!(rt.fec_buffered_len(), 1, "FuturePak is retained untouched");

    // p2 and p3 arrive; p1 is the sole remaining hole once the tail advances.
    rt.insert_media(2, 20, now, PacketType::Primary, Bytes::from(p2.clone())).unwrap();
    rt.insert_media(3, 30, now, PacketType::Primary, Bytes::from(p3.clone())).unwrap();

    let emitted = rt.tick(now + std::time::Duration::from_millis(20));
    assert_eq!(rt.fec_buffered_len(), 0, "resolved once the range became decidable");
    assert!(
        emitted.iter().any(|p| p.seq_num == 1) || rt.pcm().peek(1).is_some(),
        "recovered p1 should have been inserted back into the PCM"
    );
}

#[test]
fn matrix_out_of_range_is_rejected_before_buffering() {
    let mut rt = runtime(false);
    let now = Instant::now();
    let hdr = FecHeader {
        sn_base_low_bits: 0,
        length_recovery: 0,
        pt_recovery: 96,
        ts_recovery: 0,
        axis: FecAxis::Column,
        offset: 25, // L=25 > MAX_L=20
        na_bits: 4,
    };
    let result = rt.insert_fec(1000, 0, now, hdr, BytesMut::zeroed(8).freeze());
    assert!(result.is_err());
}
