//! Emulator bridge end to end: a TCP client speaking the Chessnut protocol
//! receives position notifications for moves played on the board.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use common::Rig;
use tabula_controller::emulators::ProtocolServer;

const PORT: u16 = 35553;

async fn read_exact_with_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

#[tokio::test]
async fn chessnut_client_sees_board_moves() {
    let mut rig = Rig::start().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProtocolServer {
        port: PORT,
        game: rig.game.clone(),
        board: rig.board.clone(),
        system: rig.system.clone(),
    };
    let _server = server.start(shutdown_rx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TcpStream::connect(("127.0.0.1", PORT))
        .await
        .expect("connect");

    // Enable reporting; the first notification carries the start position.
    client.write_all(&[0x21, 0x01, 0x00]).await.unwrap();
    client.flush().await.unwrap();
    let frame = read_exact_with_timeout(&mut client, 38).await;
    assert_eq!(frame[0], 0x01);
    assert_eq!(frame[1], 0x24);

    // The connection marks the client type and pauses local players.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.system.snapshot().client_type.as_deref(), Some("chessnut"));

    // A move on the wood produces a fresh notification.
    rig.lift("e2").await;
    rig.place("e4").await;
    rig.expect_move().await;

    let mut notified = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while notified.len() < 38 {
        let mut chunk = [0u8; 64];
        let n = tokio::time::timeout_at(deadline, client.read(&mut chunk))
            .await
            .expect("no notification after the move")
            .expect("read failed");
        assert!(n > 0, "connection closed");
        notified.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(notified[0], 0x01);
    assert_eq!(notified[1], 0x24);

    // Battery request answers from system state.
    client.write_all(&[0x29, 0x00]).await.unwrap();
    client.flush().await.unwrap();
    let battery = read_exact_with_timeout(&mut client, 4).await;
    assert_eq!(battery[0], 0x2a);

    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.system.snapshot().client_type, None);
}
