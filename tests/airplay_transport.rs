use tokio::net::UdpSocket;
use unison::airplay::rtp::{self, payload_type, RtpHeader, TimingStamps};
use unison::airplay::{bind_from, AirplayEvent, AirplaySender, AirplaySession, AirplaySocket};
use unison::error::Error;
use unison::time::Clock;

/// Grab two consecutive UDP ports and verify the one after them is free,
/// so the walk-up behavior of `bind_from` is observable.
fn occupy_two_consecutive() -> (std::net::UdpSocket, std::net::UdpSocket, u16) {
    for base in (20_000u16..60_000).step_by(17) {
        let Ok(first) = std::net::UdpSocket::bind(("0.0.0.0", base)) else {
            continue;
        };
        let Ok(second) = std::net::UdpSocket::bind(("0.0.0.0", base + 1)) else {
            continue;
        };
        match std::net::UdpSocket::bind(("0.0.0.0", base + 2)) {
            Ok(third) => {
                drop(third);
                return (first, second, base);
            }
            Err(_) => continue,
        }
    }
    panic!("no run of free ports found for the bind test");
}

fn timing_request(seqnum: u16, send_ms: f64) -> Vec<u8> {
    let header = RtpHeader {
        extension: false,
        source: 0,
        marker: true,
        payload_type: payload_type::TIMING_REQUEST,
        seqnum,
    };
    rtp::encode_timing(
        header,
        &TimingStamps {
            reference_ms: 0.0,
            received_ms: 0.0,
            send_ms,
        },
    )
}

async fn device_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

// S6: with the base port and its successor occupied, the socket lands on
// base + 2.
#[tokio::test]
async fn test_bind_walks_past_occupied_ports() {
    let (_first, _second, base) = occupy_two_consecutive();
    let (_socket, port) = bind_from(base).await.unwrap();
    assert_eq!(port, base + 2, "bind should walk to the first free port");
}

// S5: a timing request is reflected with the original send time in the
// reference slot and the sequence number preserved.
#[tokio::test]
async fn test_timing_request_reflection_over_udp() {
    let socket = AirplaySocket::bind(0, Clock::new()).await.unwrap();
    let device = device_socket().await;

    let send_ms = 1_700_000_000_000.0;
    device
        .send_to(&timing_request(902, send_ms), ("127.0.0.1", socket.port()))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        device.recv_from(&mut buf),
    )
    .await
    .expect("reflection should arrive")
    .unwrap();

    let response = &buf[..len];
    let header = RtpHeader::parse(response).unwrap();
    assert_eq!(header.payload_type, payload_type::TIMING_RESPONSE);
    assert_eq!(header.seqnum, 902);

    let stamps = rtp::parse_timing(response).unwrap();
    assert!(
        (stamps.reference_ms - send_ms).abs() < 1.0,
        "reference slot must echo the device's send time"
    );
    assert!(
        (stamps.received_ms - stamps.send_ms).abs() < 1.0,
        "received and send slots are stamped together"
    );
}

// Malformed and unknown packets are dropped without killing the receiver.
#[tokio::test]
async fn test_malformed_packets_are_ignored() {
    let socket = AirplaySocket::bind(0, Clock::new()).await.unwrap();
    let device = device_socket().await;
    let target = ("127.0.0.1", socket.port());

    device.send_to(&[0x80], target).await.unwrap();
    device.send_to(&[0x80, 0x61, 0, 1, 2, 3], target).await.unwrap();
    // Truncated timing request: header says timing, body too short.
    device.send_to(&[0x80, 0xd2, 0, 1], target).await.unwrap();

    // The receiver must still answer a well-formed request afterwards.
    device
        .send_to(&timing_request(1, 1_000.0), target)
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let received = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        device.recv_from(&mut buf),
    )
    .await;
    assert!(received.is_ok(), "receive loop should survive junk packets");
}

// Audio packets carry the first-packet marker, the timestamp, the session
// id, and the payload; resend requests replay them byte-identical.
#[tokio::test]
async fn test_audio_send_and_resend_replay() {
    let socket = AirplaySocket::bind(0, Clock::new()).await.unwrap();
    let mut events = socket.take_events().unwrap();
    let device = device_socket().await;
    let target = ("127.0.0.1", socket.port());

    // Timing traffic establishes the client port.
    device
        .send_to(&timing_request(1, 0.0), target)
        .await
        .unwrap();
    let mut buf = [0u8; 2048];
    device.recv_from(&mut buf).await.unwrap();

    let sender = AirplaySender::new(
        &socket,
        AirplaySession {
            client_session_id: 0xDEAD_BEEF,
            aes_key: None,
            aes_iv: None,
        },
        Clock::new(),
        352,
        16,
    );

    let mut originals = Vec::new();
    for (i, payload) in [b"frame-0", b"frame-1", b"frame-2"].iter().enumerate() {
        let timestamp = i as u32 * 352;
        let seq = sender.send_audio(timestamp, *payload).await.unwrap();
        assert_eq!(seq, i as u16, "sequence derives from the timestamp");

        let (len, _) = device.recv_from(&mut buf).await.unwrap();
        let packet = buf[..len].to_vec();
        assert_eq!(packet[0], 0x80);
        let expected_byte1 = if i == 0 { 0xe0 } else { 0x60 };
        assert_eq!(packet[1], expected_byte1, "first packet carries the marker");
        assert_eq!(
            u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            timestamp
        );
        assert_eq!(
            u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            0xDEAD_BEEF
        );
        assert_eq!(&packet[12..], *payload);
        originals.push(packet);
    }

    // Device reports packets 1 and 2 missing.
    let mut resend = RtpHeader {
        extension: false,
        source: 0,
        marker: true,
        payload_type: payload_type::RANGE_RESEND,
        seqnum: 1,
    }
    .encode()
    .to_vec();
    resend.extend_from_slice(&1u16.to_be_bytes());
    resend.extend_from_slice(&2u16.to_be_bytes());
    device.send_to(&resend, target).await.unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("resend request should surface")
        .unwrap();
    let AirplayEvent::ResendRequested(range) = event;
    assert_eq!(range.missed_seq, 1);
    assert_eq!(range.missed_count, 2);

    let replayed = sender.resend(range).await.unwrap();
    assert_eq!(replayed, 2);
    for expected in &originals[1..] {
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            device.recv_from(&mut buf),
        )
        .await
        .expect("replayed packet should arrive")
        .unwrap();
        assert_eq!(&buf[..len], &expected[..], "replay must be byte-identical");
    }
}

// The sender refuses to transmit before the device's port is known.
#[tokio::test]
async fn test_send_requires_established_client_port() {
    let socket = AirplaySocket::bind(0, Clock::new()).await.unwrap();
    let sender = AirplaySender::new(
        &socket,
        AirplaySession::default(),
        Clock::new(),
        352,
        16,
    );
    match sender.send_audio(0, b"frame").await {
        Err(Error::NoRemotePort) => {}
        other => panic!("expected NoRemotePort, got {other:?}"),
    }
    match sender.send_sync(352, 88_200).await {
        Err(Error::NoRemotePort) => {}
        other => panic!("expected NoRemotePort, got {other:?}"),
    }
}

// Sync beacons: marker set, sequence 7, latency-adjusted slot first, raw
// next-chunk timestamp last, extension bit only on the first beacon.
#[tokio::test]
async fn test_sync_beacon_layout() {
    let socket = AirplaySocket::bind(0, Clock::new()).await.unwrap();
    let device = device_socket().await;
    let target = ("127.0.0.1", socket.port());
    device
        .send_to(&timing_request(1, 0.0), target)
        .await
        .unwrap();
    let mut buf = [0u8; 2048];
    device.recv_from(&mut buf).await.unwrap();

    let sender = AirplaySender::new(
        &socket,
        AirplaySession::default(),
        Clock::new(),
        352,
        16,
    );

    sender.send_sync(100_000, 11_025).await.unwrap();
    let (len, _) = device.recv_from(&mut buf).await.unwrap();
    let beacon = &buf[..len];
    let header = RtpHeader::parse(beacon).unwrap();
    assert_eq!(header.payload_type, payload_type::SYNC);
    assert!(header.marker);
    assert_eq!(header.seqnum, 7);
    assert!(header.extension, "first beacon flags a fresh stream");
    assert_eq!(
        u32::from_be_bytes([beacon[4], beacon[5], beacon[6], beacon[7]]),
        100_000 - 11_025
    );
    assert_eq!(
        u32::from_be_bytes([beacon[16], beacon[17], beacon[18], beacon[19]]),
        100_000
    );

    sender.send_sync(101_000, 11_025).await.unwrap();
    let (len, _) = device.recv_from(&mut buf).await.unwrap();
    let header = RtpHeader::parse(&buf[..len]).unwrap();
    assert!(!header.extension, "later beacons clear the extension bit");
}
