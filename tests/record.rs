mod common;

use std::net::{IpAddr, Ipv4Addr};

use sensor_pcap::capture::{CaptureReader, LinkType};
use sensor_pcap::{
    next_packet_info, read_packet, record_initialize, record_packet, record_packet_at,
    record_uninitialize, replay_get_pcap_info, replay_initialize, IpVersion, PlaybackHandle,
    PortMap, RecordConfig,
};
use tempfile::tempdir;

use common::{ms, payload};

fn open(path: &std::path::Path) -> PlaybackHandle {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    replay_initialize(path, localhost, localhost, PortMap::new()).unwrap()
}

#[test]
fn recorded_packets_replay_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("round.pcap");
    let sent = vec![
        (7502u16, 7503u16, payload(1, 33)),
        (7503, 7502, payload(2, 1200)),
        (40000, 7502, payload(3, 1)),
        (7502, 7503, Vec::new()),
        (7502, 7503, payload(4, 6000)),
    ];

    let mut handle = record_initialize(&path, RecordConfig::default()).unwrap();
    for (src, dst, data) in &sent {
        record_packet(&mut handle, *src, *dst, data).unwrap();
    }
    assert_eq!(handle.packets(), 5);
    record_uninitialize(handle).unwrap();

    let mut playback = open(&path);
    let mut buf = vec![0u8; 65_536];
    let mut last_timestamp = None;
    for (src, dst, data) in &sent {
        let info = next_packet_info(&mut playback).unwrap().unwrap();
        assert_eq!(info.src_port, *src);
        assert_eq!(info.dst_port, *dst);
        assert_eq!(info.payload_size, data.len());
        assert_eq!(info.dst_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        if let Some(last) = last_timestamp {
            assert!(info.timestamp >= last);
        }
        last_timestamp = Some(info.timestamp);

        let n = read_packet(&playback, &mut buf).unwrap();
        assert_eq!(&buf[..n], &data[..]);
    }
    assert!(next_packet_info(&mut playback).unwrap().is_none());

    // The 6000-byte payload went out as five fragments.
    let stats = playback.stream_info();
    assert_eq!(stats.packets_reassembled, 5);
    assert_eq!(stats.packets_processed, 9);
    assert_eq!(stats.ipv4_packets, 9);
}

#[test]
fn explicit_timestamps_are_preserved() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stamped.pcap");
    let base = std::time::Duration::from_secs(1_700_000_000);

    let mut handle = record_initialize(&path, RecordConfig::default()).unwrap();
    for i in 0..3u64 {
        record_packet_at(&mut handle, 1, 2, b"tick", base + ms(i * 250)).unwrap();
    }
    record_uninitialize(handle).unwrap();

    let mut playback = open(&path);
    for i in 0..3u64 {
        let info = next_packet_info(&mut playback).unwrap().unwrap();
        assert_eq!(info.timestamp, base + ms(i * 250));
    }
}

#[test]
fn ipv6_recording_with_small_fragments() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v6.pcap");
    let config = RecordConfig {
        src_ip: "fd00::10".parse().unwrap(),
        dst_ip: "fd00::20".parse().unwrap(),
        frag_size: 576,
        ..Default::default()
    };
    let data = payload(7, 2000);

    let mut handle = record_initialize(&path, config).unwrap();
    record_packet(&mut handle, 9000, 9001, &data).unwrap();
    record_packet(&mut handle, 9000, 9001, b"small").unwrap();
    record_uninitialize(handle).unwrap();

    let mut playback = open(&path);
    let info = next_packet_info(&mut playback).unwrap().unwrap();
    assert_eq!(info.ip_version, IpVersion::V6);
    assert_eq!(info.dst_ip, "fd00::20".parse::<IpAddr>().unwrap());
    assert_eq!(info.payload_size, 2000);
    assert!(info.fragments > 1);
    let mut buf = vec![0u8; 2001];
    read_packet(&playback, &mut buf).unwrap();
    assert_eq!(&buf[..2000], &data[..]);

    let info = next_packet_info(&mut playback).unwrap().unwrap();
    assert_eq!(info.fragments, 1);
    assert_eq!(info.payload_size, 5);
}

#[test]
fn sll_recording_uses_cooked_link_type() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sll.pcap");
    let config = RecordConfig {
        use_sll_encapsulation: true,
        ..Default::default()
    };

    let mut handle = record_initialize(&path, config).unwrap();
    record_packet(&mut handle, 1, 7502, &payload(0, 3000)).unwrap();
    record_uninitialize(handle).unwrap();

    let reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.link_type(), LinkType::LinuxSll);

    let stats = replay_get_pcap_info(&path, None).unwrap();
    assert_eq!(stats.packets_processed, 3);
    assert_eq!(stats.packets_reassembled, 1);
    assert_eq!(stats.port_to_packet_count[&7502], 1);
}

#[test]
fn recording_over_an_existing_capture_replaces_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reused.pcap");

    let mut first = record_initialize(&path, RecordConfig::default()).unwrap();
    for _ in 0..4 {
        record_packet(&mut first, 1, 2, b"old").unwrap();
    }
    record_uninitialize(first).unwrap();

    let mut second = record_initialize(&path, RecordConfig::default()).unwrap();
    record_packet(&mut second, 3, 4, b"new!").unwrap();
    record_uninitialize(second).unwrap();

    let stats = replay_get_pcap_info(&path, None).unwrap();
    assert_eq!(stats.packets_processed, 1);
    assert_eq!(stats.port_to_packet_count.keys().copied().collect::<Vec<_>>(), vec![4]);
}

#[test]
fn unwritable_destination_fails_to_initialize() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("out.pcap");
    assert!(record_initialize(&path, RecordConfig::default()).is_err());
}
