#![allow(clippy::unwrap_used, clippy::expect_used)]

use rand::Rng;
use secure_stream::{Connection, SessionConfig};
use tokio::io::{duplex, DuplexStream};

const KEY: &[u8] = b"stress key";

#[tokio::test]
async fn stress_request_response_across_many_rekeys() {
    // Simulate a long-lived session that renegotiates every few messages
    let config = SessionConfig::with_rekey_after(4096);
    let (a, b) = duplex(256 * 1024);
    let (server, client) = tokio::join!(
        Connection::<DuplexStream>::builder(KEY)
            .server(true)
            .config(config)
            .upgrade(a),
        Connection::<DuplexStream>::builder(KEY).config(config).upgrade(b),
    );
    let server = server.unwrap();
    let client = client.unwrap();

    let rounds = 2_000usize;
    let sizes: Vec<usize> = {
        let mut rng = rand::rng();
        (0..rounds).map(|_| rng.random_range(0..3000)).collect()
    };

    let server_side = async {
        for _ in 0..rounds {
            let request = server.receive().await.unwrap();
            server.send(&request).await.unwrap();
        }
    };
    let client_side = async {
        for (i, &size) in sizes.iter().enumerate() {
            let message = vec![(i % 251) as u8; size];
            client.send(&message).await.unwrap();
            let reply = client.receive().await.unwrap();
            assert_eq!(reply, message, "round {i}");
        }
    };
    tokio::join!(server_side, client_side);

    let server_stats = server.metrics().snapshot();
    let client_stats = client.metrics().snapshot();
    assert!(server_stats.rekeys_success > 100);
    assert_eq!(server_stats.rekeys_failed, 0);
    assert_eq!(client_stats.rekeys_failed, 0);
    assert_eq!(server_stats.rekeys_success, client_stats.rekeys_success);
    assert_eq!(client_stats.packets_received, rounds as u64);
}

#[tokio::test]
async fn stress_repeated_manual_rekeys() {
    let (a, b) = duplex(64 * 1024);
    let (server, client) = tokio::join!(
        Connection::upgrade(a, true, KEY),
        Connection::upgrade(b, false, KEY)
    );
    let server = server.unwrap();
    let client = client.unwrap();

    for i in 0..200u32 {
        let server_side = async {
            server.rekey().await.unwrap();
            server.send(&i.to_le_bytes()).await.unwrap();
        };
        let ((), received) = tokio::join!(server_side, client.receive());
        assert_eq!(received.unwrap(), i.to_le_bytes());
    }

    assert_eq!(server.epoch(), 201);
    assert_eq!(client.epoch(), 201);
}
