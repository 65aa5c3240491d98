//! Message exchange over real loopback sockets: send/receive round-trips,
//!  piggybacked and keepalive acks, the strict one-ahead accept filter at the
//!  wire level, and demultiplexing of several connections on one endpoint.

use bytes::BytesMut;
use rudp::config::RudpConfig;
use rudp::connection::{Connection, ConnectionState};
use rudp::error::RudpError;
use rudp::multiplexer::Multiplexer;
use rudp::packet_header::{PacketHeader, PacketKind};
use rudp::sequence_number::SequenceNumber;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;

fn test_config() -> Arc<RudpConfig> {
    Arc::new(RudpConfig {
        retransmit_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        ..RudpConfig::default()
    })
}

/// Two established connections over loopback; the first one accepted, the
///  second one actively connected.
async fn established_pair() -> (Arc<Connection>, Arc<Connection>) {
    let a = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
    let a_addr = a.local_addr().unwrap();
    let accept = {
        let a = a.clone();
        tokio::spawn(async move { a.accept().await })
    };
    time::sleep(Duration::from_millis(20)).await;

    let b = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
    b.connect(a_addr).await.unwrap();
    accept.await.unwrap().unwrap();

    (a, b)
}

#[tokio::test]
async fn test_send_receive_roundtrip() {
    let (a, b) = established_pair().await;

    let receiver = {
        let a = a.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = a.receive(&mut buf).await.unwrap();
            (n, buf)
        })
    };
    time::sleep(Duration::from_millis(20)).await;

    // the send completes only once the receiver's keepalive ack came back
    assert_eq!(b.send(b"hello").await, Ok(5));

    let (n, buf) = receiver.await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
}

#[tokio::test]
async fn test_data_arriving_before_receive_is_parked() {
    let (a, b) = established_pair().await;

    // no receive is pending on A, so the payload parks there and the send
    //  cannot complete yet
    let first_send = {
        let b = b.clone();
        tokio::spawn(async move { b.send(b"one").await })
    };
    time::sleep(Duration::from_millis(100)).await;
    assert!(!first_send.is_finished());

    let mut buf = [0u8; 8];
    assert_eq!(a.receive(&mut buf).await, Ok(3));
    assert_eq!(&buf[..3], b"one");

    // the next exchange produces a keepalive ack that covers both messages
    let receiver = {
        let a = a.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = a.receive(&mut buf).await.unwrap();
            (n, buf)
        })
    };
    time::sleep(Duration::from_millis(20)).await;

    assert_eq!(b.send(b"two").await, Ok(3));
    assert_eq!(first_send.await.unwrap(), Ok(3));

    let (n, buf) = receiver.await.unwrap();
    assert_eq!(&buf[..n], b"two");
}

#[tokio::test]
async fn test_data_flows_in_both_directions() {
    let (a, b) = established_pair().await;

    for (from, to, payload) in [
        (&b, &a, &b"from-connector"[..]),
        (&a, &b, &b"from-listener"[..]),
        (&b, &a, &b"and-back"[..]),
    ] {
        let receiver = {
            let to = to.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 32];
                let n = to.receive(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        time::sleep(Duration::from_millis(20)).await;

        assert_eq!(from.send(payload).await, Ok(payload.len()));
        assert_eq!(receiver.await.unwrap(), payload.to_vec());
    }
}

#[tokio::test]
async fn test_messages_are_preserved_not_concatenated() {
    let (a, b) = established_pair().await;

    for payload in [&b"first"[..], &b"second"[..], &b"third"[..]] {
        let receiver = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = a.receive(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        time::sleep(Duration::from_millis(20)).await;

        assert_eq!(b.send(payload).await, Ok(payload.len()));
        assert_eq!(receiver.await.unwrap(), payload.to_vec());
    }
}

#[tokio::test]
async fn test_binary_payload_roundtrip() {
    let (a, b) = established_pair().await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();

    let receiver = {
        let a = a.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let n = a.receive(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        })
    };
    time::sleep(Duration::from_millis(20)).await;

    assert_eq!(b.send(&payload).await, Ok(1024));
    assert_eq!(receiver.await.unwrap(), payload);
}

/// Drives a listening connection with hand-assembled datagrams from a plain
///  UDP socket: handshake, establishment, and the one-ahead accept filter.
#[tokio::test]
async fn test_out_of_sequence_data_is_dropped_at_the_wire() {
    let a = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
    let a_addr = a.local_addr().unwrap();
    let accept = {
        let a = a.clone();
        tokio::spawn(async move { a.accept().await })
    };
    time::sleep(Duration::from_millis(20)).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // handshake with initial sequence 100
    let mut buf = BytesMut::new();
    PacketHeader::new(PacketKind::Handshake, SequenceNumber::from_raw(100), None).ser(&mut buf);
    peer.send_to(&buf, a_addr).await.unwrap();

    // the listener answers with its own handshake acking ours
    let mut rbuf = [0u8; 1500];
    let (n, _) = peer.recv_from(&mut rbuf).await.unwrap();
    let mut parse = &rbuf[..n];
    let reply = PacketHeader::deser(&mut parse).unwrap();
    assert_eq!(reply.packet_kind, PacketKind::Handshake);
    assert_eq!(reply.ack, Some(SequenceNumber::from_raw(100)));

    // ack the answer - the listener is established now
    let mut buf = BytesMut::new();
    PacketHeader::new(PacketKind::Keepalive, SequenceNumber::from_raw(101), Some(reply.sequence)).ser(&mut buf);
    peer.send_to(&buf, a_addr).await.unwrap();
    accept.await.unwrap().unwrap();
    assert_eq!(a.state().await, ConnectionState::Established);
    assert_eq!(a.last_remote_sequence(), Some(SequenceNumber::from_raw(100)));

    let receiver = {
        let a = a.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = a.receive(&mut buf).await.unwrap();
            buf[..n].to_vec()
        })
    };
    time::sleep(Duration::from_millis(20)).await;

    // sequence 103 skips ahead of the expected 101: silently dropped
    let mut buf = BytesMut::new();
    PacketHeader::new(PacketKind::Data, SequenceNumber::from_raw(103), Some(SequenceNumber::from_raw(100))).ser(&mut buf);
    buf.extend_from_slice(b"skipped");
    peer.send_to(&buf, a_addr).await.unwrap();

    time::sleep(Duration::from_millis(100)).await;
    assert!(!receiver.is_finished());
    assert_eq!(a.last_remote_sequence(), Some(SequenceNumber::from_raw(100)));

    // the expected successor is accepted and answered with a keepalive ack
    let mut buf = BytesMut::new();
    PacketHeader::new(PacketKind::Data, SequenceNumber::from_raw(101), Some(SequenceNumber::from_raw(100))).ser(&mut buf);
    buf.extend_from_slice(b"hello");
    peer.send_to(&buf, a_addr).await.unwrap();

    assert_eq!(receiver.await.unwrap(), b"hello".to_vec());
    assert_eq!(a.last_remote_sequence(), Some(SequenceNumber::from_raw(101)));

    let (n, _) = peer.recv_from(&mut rbuf).await.unwrap();
    let mut parse = &rbuf[..n];
    let keepalive = PacketHeader::deser(&mut parse).unwrap();
    assert_eq!(keepalive.packet_kind, PacketKind::Keepalive);
    assert_eq!(keepalive.ack, Some(SequenceNumber::from_raw(101)));
}

#[tokio::test]
async fn test_one_endpoint_serves_multiple_connections() {
    let (a1, a1_addr, accept1) = {
        let conn = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
        let addr = conn.local_addr().unwrap();
        let accept = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.accept().await })
        };
        (conn, addr, accept)
    };
    let (a2, a2_addr, accept2) = {
        let conn = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
        let addr = conn.local_addr().unwrap();
        let accept = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.accept().await })
        };
        (conn, addr, accept)
    };
    time::sleep(Duration::from_millis(20)).await;

    // both outbound connections share one bound endpoint
    let mux = Multiplexer::bind("127.0.0.1:0", test_config()).await.unwrap();
    let b1 = Connection::with_multiplexer(mux.clone());
    let b2 = Connection::with_multiplexer(mux);

    b1.connect(a1_addr).await.unwrap();
    b2.connect(a2_addr).await.unwrap();
    accept1.await.unwrap().unwrap();
    accept2.await.unwrap().unwrap();

    for (a, b, payload) in [(&a1, &b1, &b"to-one"[..]), (&a2, &b2, &b"to-two"[..])] {
        let receiver = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = a.receive(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        time::sleep(Duration::from_millis(20)).await;

        assert_eq!(b.send(payload).await, Ok(payload.len()));
        assert_eq!(receiver.await.unwrap(), payload.to_vec());
    }
}

#[tokio::test]
async fn test_duplicate_remote_on_one_endpoint_is_rejected() {
    let (_a, a_addr, accept) = {
        let conn = Arc::new(Connection::bind("127.0.0.1:0", test_config()).await.unwrap());
        let addr = conn.local_addr().unwrap();
        let accept = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.accept().await })
        };
        (conn, addr, accept)
    };
    time::sleep(Duration::from_millis(20)).await;

    let mux = Multiplexer::bind("127.0.0.1:0", test_config()).await.unwrap();
    let b1 = Connection::with_multiplexer(mux.clone());
    let b2 = Connection::with_multiplexer(mux);

    b1.connect(a_addr).await.unwrap();
    accept.await.unwrap().unwrap();

    assert_eq!(b2.connect(a_addr).await, Err(RudpError::AddressInUse));
}
