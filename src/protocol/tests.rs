// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::config::SessionConfig;
use crate::core::budget::ByteBudget;
use crate::core::codec::{FrameReader, FrameWriter};
use crate::core::packet::FrameHeader;
use crate::error::ProtocolError;
use crate::protocol::rekey::{
    Handshake, RekeyTrigger, Role, VERIFY_DATA, VERIFY_DATA_RESPONSE, VERIFY_DATA_RESULT,
};
use crate::transport::Connection;
use crate::utils::crypto::{random_material, SessionCipher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

type PeerReader = FrameReader<ReadHalf<DuplexStream>>;
type PeerWriter = FrameWriter<WriteHalf<DuplexStream>>;

/// A stream for the connection under test and a hand-driven peer on the other end
fn fake_peer() -> (DuplexStream, PeerReader, PeerWriter, ByteBudget) {
    let (local, remote) = duplex(64 * 1024);
    let (r, w) = split(remote);
    let config = SessionConfig::default();
    (
        local,
        FrameReader::new(r, config.max_packet_length),
        FrameWriter::new(w, config.max_packet_length),
        ByteBudget::new(&config),
    )
}

async fn expect_rekey_signal(reader: &mut PeerReader, budget: &ByteBudget) {
    let (header, _) = reader.receive_frame(None, &[], budget).await.unwrap();
    assert_eq!(header, FrameHeader::Rekey);
}

#[tokio::test]
async fn test_tampered_response_fails_both_sides_then_recovers() {
    let (stream, mut reader, mut writer, budget) = fake_peer();

    let (conn, peer_cipher) = tokio::join!(
        Connection::upgrade(stream, true, KEY),
        Handshake::new(Role::Responder, KEY, &budget).run(&mut reader, &mut writer),
    );
    let conn = conn.unwrap();
    peer_cipher.unwrap();
    assert!(conn.is_established());

    let tampering_peer = async {
        expect_rekey_signal(&mut reader, &budget).await;
        let material = reader.receive_data(None, &[], &budget).await.unwrap();
        let cipher = SessionCipher::derive(KEY, &material).unwrap();
        let challenge = reader
            .receive_data(Some(&cipher), VERIFY_DATA, &budget)
            .await
            .unwrap();
        // Echo without reversing
        writer
            .send_frame(
                FrameHeader::Data,
                &challenge,
                Some(&cipher),
                VERIFY_DATA_RESPONSE,
            )
            .await
            .unwrap();
        reader
            .receive_data(Some(&cipher), VERIFY_DATA_RESULT, &budget)
            .await
            .unwrap()
    };

    let (result, verdict) = tokio::join!(conn.rekey(), tampering_peer);
    assert!(matches!(result, Err(ProtocolError::VerificationFailed)));
    assert_eq!(verdict, vec![0]);
    assert!(!conn.is_established());
    assert!(matches!(
        conn.send(b"too early").await,
        Err(ProtocolError::SessionNotEstablished)
    ));

    let honest_peer = async {
        expect_rekey_signal(&mut reader, &budget).await;
        Handshake::new(Role::Responder, KEY, &budget)
            .run(&mut reader, &mut writer)
            .await
    };
    let (result, peer_cipher) = tokio::join!(conn.rekey(), honest_peer);
    result.unwrap();
    let peer_cipher = peer_cipher.unwrap();
    assert!(conn.is_established());

    conn.send(b"after recovery").await.unwrap();
    let payload = reader
        .receive_data(Some(&peer_cipher), &[], &budget)
        .await
        .unwrap();
    assert_eq!(payload, b"after recovery");
}

#[tokio::test]
async fn test_client_rejects_negative_verdict() {
    let (stream, mut reader, mut writer, budget) = fake_peer();

    let lying_server = async {
        let material = random_material(64).unwrap();
        writer
            .send_frame(FrameHeader::Data, &material, None, &[])
            .await
            .unwrap();
        let cipher = SessionCipher::derive(KEY, &material).unwrap();
        let challenge = random_material(64).unwrap();
        writer
            .send_frame(FrameHeader::Data, &challenge, Some(&cipher), VERIFY_DATA)
            .await
            .unwrap();
        let response = reader
            .receive_data(Some(&cipher), VERIFY_DATA_RESPONSE, &budget)
            .await
            .unwrap();
        let reversed: Vec<u8> = challenge.iter().rev().copied().collect();
        assert_eq!(response, reversed);
        writer
            .send_frame(FrameHeader::Data, &[0], Some(&cipher), VERIFY_DATA_RESULT)
            .await
            .unwrap();
    };

    let (conn, ()) = tokio::join!(Connection::upgrade(stream, false, KEY), lying_server);
    assert!(matches!(conn, Err(ProtocolError::VerificationFailed)));
}

#[tokio::test]
async fn test_two_rekey_signals_in_a_row() {
    let (stream, mut reader, mut writer, budget) = fake_peer();

    let (conn, peer_cipher) = tokio::join!(
        Connection::upgrade(stream, false, KEY),
        Handshake::new(Role::Initiator, KEY, &budget).run(&mut reader, &mut writer),
    );
    let conn = conn.unwrap();
    peer_cipher.unwrap();

    let double_signal = async {
        writer.send_rekey().await.unwrap();
        Handshake::new(Role::Initiator, KEY, &budget)
            .run(&mut reader, &mut writer)
            .await
            .unwrap();
        writer.send_rekey().await.unwrap();
    };

    let (result, ()) = tokio::join!(conn.receive(), double_signal);
    assert!(matches!(result, Err(ProtocolError::RecursiveRekey)));
    assert_eq!(conn.epoch(), 2);
}

#[tokio::test]
async fn test_hard_ceiling_forces_single_rekey_before_send() {
    let (a, b) = duplex(64 * 1024);
    let attempts = Arc::new(AtomicUsize::new(0));
    let triggers = Arc::new(Mutex::new(Vec::new()));

    let counter = attempts.clone();
    let seen = triggers.clone();
    let server_builder = Connection::<DuplexStream>::builder(KEY)
        .server(true)
        .on_pre_rekey(move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(event.trigger);
        });

    let (server, client) = tokio::join!(
        server_builder.upgrade(a),
        Connection::upgrade(b, false, KEY),
    );
    let server = server.unwrap();
    let client = client.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let reject = SessionConfig::default().reject_after_bytes;
    server.set_bytes_since_rekey(reject - 1).unwrap();

    let (sent, received) = tokio::join!(server.send(b"hi"), client.receive());
    sent.unwrap();
    assert_eq!(received.unwrap(), b"hi");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        *triggers.lock().unwrap(),
        vec![RekeyTrigger::Initial, RekeyTrigger::Threshold]
    );
    assert_eq!(server.bytes_since_rekey(), 2 + 44);
    assert_eq!(server.epoch(), 2);
    assert_eq!(client.epoch(), 2);
}

#[tokio::test]
async fn test_mismatched_aad_is_decryption_failure() {
    let (stream, mut reader, mut writer, budget) = fake_peer();

    let (conn, peer_cipher) = tokio::join!(
        Connection::upgrade(stream, false, KEY),
        Handshake::new(Role::Initiator, KEY, &budget).run(&mut reader, &mut writer),
    );
    let conn = conn.unwrap();
    let peer_cipher = peer_cipher.unwrap();

    writer
        .send_frame(FrameHeader::Data, b"bound", Some(&peer_cipher), b"header-a")
        .await
        .unwrap();
    let result = conn.receive_with_aad(b"header-b").await;
    assert!(matches!(result, Err(ProtocolError::DecryptionFailure)));

    let snapshot = conn.metrics().snapshot();
    assert_eq!(snapshot.protocol_errors, 1);
    assert_eq!(snapshot.verification_failures, 1);
    assert_eq!(snapshot.packets_received, 0);
}

#[tokio::test]
async fn test_payload_survives_failed_rekey_on_receive() {
    let (stream, mut reader, mut writer, budget) = fake_peer();
    let failures = Arc::new(Mutex::new(Vec::new()));

    let log = failures.clone();
    let client = Connection::<DuplexStream>::builder(KEY)
        .config(SessionConfig::with_rekey_after(4096))
        .on_post_rekey(move |event, err| {
            if let Some(err) = err {
                log.lock().unwrap().push((event.trigger, err.to_string()));
            }
        })
        .upgrade(stream);

    let (conn, peer_cipher) = tokio::join!(
        client,
        Handshake::new(Role::Initiator, KEY, &budget).run(&mut reader, &mut writer),
    );
    let conn = conn.unwrap();
    let peer_cipher = peer_cipher.unwrap();

    conn.set_bytes_since_rekey(4095).unwrap();
    writer
        .send_frame(FrameHeader::Data, b"last words", Some(&peer_cipher), &[])
        .await
        .unwrap();

    // Peer hangs up as soon as the rekey is requested
    let vanishing_peer = async move {
        expect_rekey_signal(&mut reader, &budget).await;
        drop(reader);
        drop(writer);
    };

    let (received, ()) = tokio::join!(conn.receive(), vanishing_peer);
    assert_eq!(received.unwrap(), b"last words");

    let failures = failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, RekeyTrigger::Threshold);
    assert!(!conn.is_established());
    assert!(matches!(
        conn.send(b"too late").await,
        Err(ProtocolError::SessionNotEstablished)
    ));
    assert_eq!(conn.metrics().snapshot().rekeys_failed, 1);
}
