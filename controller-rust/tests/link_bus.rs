//! Bus arbiter behavior against a scripted wire peer: discovery handshake,
//! retry budget, raw capture, and low-priority pre-emption.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use boardlink_types::{build_packet, Command};
use tabula_controller::link::{Bus, LinkError};

/// Scripted peer: answers discovery, counts changes requests without ever
/// answering them, answers battery requests after a configurable delay.
struct Peer {
    changes_seen: Arc<AtomicUsize>,
    battery_delay: Duration,
}

fn spawn_peer(stream: tokio::io::DuplexStream, peer: Peer) {
    tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(stream);
        let mut rx: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = match read.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            rx.extend_from_slice(&buf[..n]);
            // Commands from the controller with no payload are 4 bytes.
            while rx.len() >= 4 {
                let cmd = rx[0];
                match cmd {
                    0x46 => {
                        rx.drain(..4);
                        let frame = build_packet(0x90, 0x06, 0x50, Some(&[]));
                        let mut doubled = frame.clone();
                        doubled.extend_from_slice(&frame);
                        let _ = write.write_all(&doubled).await;
                    }
                    0x83 => {
                        rx.drain(..4);
                        peer.changes_seen.fetch_add(1, Ordering::SeqCst);
                        // Never answer: the caller must time out.
                    }
                    0x98 => {
                        rx.drain(..4);
                        tokio::time::sleep(peer.battery_delay).await;
                        let frame = build_packet(0xb5, 0x06, 0x50, Some(&[0x10]));
                        let _ = write.write_all(&frame).await;
                    }
                    0x58 | 0x82 | 0x97 => {
                        rx.drain(..4);
                    }
                    0xf0 => {
                        // Snapshot command carries a payload; consume the
                        // whole declared frame, then reply with 134 raw
                        // bytes.
                        if rx.len() < 3 {
                            break;
                        }
                        let declared =
                            ((usize::from(rx[1] & 0x7f)) << 7) | usize::from(rx[2] & 0x7f);
                        if rx.len() < declared {
                            break;
                        }
                        rx.drain(..declared);
                        let mut reply = vec![0xf0, 0x01, 0x06, 0x06, 0x50, 0x7f];
                        for i in 0..128u8 {
                            reply.push(i);
                        }
                        let _ = write.write_all(&reply).await;
                    }
                    _ => {
                        rx.remove(0);
                    }
                }
            }
            let _ = write.flush().await;
        }
    });
}

async fn ready_bus(peer: Peer) -> (Bus, watch::Sender<bool>) {
    let (controller_side, peer_side) = tokio::io::duplex(8 * 1024);
    spawn_peer(peer_side, peer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (bus, _events, _task) = Bus::start(Box::new(controller_side), shutdown_rx);
    bus.begin_discovery().await.unwrap();
    assert!(bus.wait_ready(Duration::from_secs(2)).await);
    (bus, shutdown_tx)
}

#[tokio::test]
async fn discovery_learns_the_address_from_a_doubled_frame() {
    let (bus, _guard) = ready_bus(Peer {
        changes_seen: Arc::new(AtomicUsize::new(0)),
        battery_delay: Duration::ZERO,
    })
    .await;
    assert_eq!(bus.address(), (0x06, 0x50));
}

#[tokio::test]
async fn timeout_exhausts_the_retry_budget() {
    let changes_seen = Arc::new(AtomicUsize::new(0));
    let (bus, _guard) = ready_bus(Peer {
        changes_seen: changes_seen.clone(),
        battery_delay: Duration::ZERO,
    })
    .await;

    let result = bus
        .request(
            Command::SendChanges,
            None,
            Duration::from_millis(150),
            2,
        )
        .await;
    assert!(matches!(result, Err(LinkError::Timeout { expected: 0x85 })));
    // One initial attempt plus two retries.
    assert_eq!(changes_seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn raw_capture_returns_exactly_the_requested_bytes() {
    let (bus, _guard) = ready_bus(Peer {
        changes_seen: Arc::new(AtomicUsize::new(0)),
        battery_delay: Duration::ZERO,
    })
    .await;

    let raw = bus
        .request_raw(Command::SnapshotF0, None, 134, Duration::from_secs(1), false)
        .await
        .unwrap();
    assert_eq!(raw.len(), 134);
    assert_eq!(raw[0], 0xf0);
    assert_eq!(raw[6], 0);
    assert_eq!(raw[133], 127);
}

#[tokio::test]
async fn high_priority_skips_an_outstanding_low_request() {
    let changes_seen = Arc::new(AtomicUsize::new(0));
    let (bus, _guard) = ready_bus(Peer {
        changes_seen: changes_seen.clone(),
        battery_delay: Duration::from_millis(50),
    })
    .await;

    // Low-priority poll that would otherwise wait a long time.
    let low_bus = bus.clone();
    let low = tokio::spawn(async move {
        low_bus
            .request_low(Command::SendChanges, None, Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // High-priority request cancels it and still completes.
    let high = bus
        .request(
            Command::SendBatteryInfo,
            None,
            Duration::from_secs(2),
            0,
        )
        .await;
    assert!(high.is_ok(), "high priority failed: {high:?}");

    let low_result = tokio::time::timeout(Duration::from_secs(1), low)
        .await
        .expect("low request hung")
        .unwrap();
    assert!(matches!(low_result, Err(LinkError::Skipped)));
}

#[tokio::test]
async fn low_priority_rejected_while_high_is_pending() {
    let (bus, _guard) = ready_bus(Peer {
        changes_seen: Arc::new(AtomicUsize::new(0)),
        // Slow battery answer keeps the high request outstanding.
        battery_delay: Duration::from_millis(300),
    })
    .await;

    let high_bus = bus.clone();
    let high = tokio::spawn(async move {
        high_bus
            .request(Command::SendBatteryInfo, None, Duration::from_secs(2), 0)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let low = bus
        .request_low(Command::SendChanges, None, Duration::from_secs(1))
        .await;
    assert!(matches!(low, Err(LinkError::Skipped)));
    assert!(high.await.unwrap().is_ok());
}
