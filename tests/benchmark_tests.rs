//! Coarse performance checks for hot protocol paths

use client::files::{FileOffer, FileTransferManager};
use client::game::GameSession;
use client::Symbol;
use shared::{field, Message, MessageKind, Scope, SocialRouter, TokenAuthority};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Benchmarks parsing of a typical DM datagram
#[test]
fn benchmark_message_parsing() {
    let raw = Message::new(MessageKind::Dm)
        .with(field::FROM, "alice@192.168.1.10")
        .with(field::TO, "bob@192.168.1.11")
        .with(field::MESSAGE_ID, "f83d2b1c0a9e4d71")
        .with(field::CONTENT, "Hello from LSNP!")
        .with(field::TIMESTAMP, "1728938500")
        .with(field::TOKEN, "alice@192.168.1.10|1728942100|chat")
        .to_bytes();
    let source: SocketAddr = "192.168.1.10:50999".parse().unwrap();

    let iterations = 50_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let message = Message::parse_from(&raw, source).unwrap();
        assert_eq!(message.kind(), Some(MessageKind::Dm));
    }

    let duration = start.elapsed();
    println!(
        "Message parsing: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );
    assert!(duration.as_secs() < 2);
}

/// Benchmarks token validation including revocation lookups
#[test]
fn benchmark_token_validation() {
    let mut authority = TokenAuthority::new();
    for i in 0..1_000 {
        let revoked = authority.issue(&format!("user{}@10.0.0.1", i), Scope::Chat, 60);
        authority.revoke(&revoked);
    }
    let token = authority.issue("alice@10.0.0.1", Scope::Chat, 3600);

    let iterations = 100_000;
    let start = Instant::now();
    for _ in 0..iterations {
        assert!(authority.is_valid(&token, Scope::Chat, "alice@10.0.0.1"));
    }

    let duration = start.elapsed();
    println!(
        "Token validation: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );
    assert!(duration.as_secs() < 2);
}

/// Benchmarks reassembly of a 1 MiB file delivered in reverse order
#[test]
fn benchmark_file_reassembly() {
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 256) as u8).collect();
    let mut sender = FileTransferManager::new(Duration::from_secs(60), Duration::from_secs(60), u64::MAX);
    let mut receiver =
        FileTransferManager::new(Duration::from_secs(60), Duration::from_secs(60), u64::MAX);

    let offer: FileOffer = sender
        .offer("bob@10.0.0.2", "blob.bin", "application/octet-stream", data.clone(), 1024, None)
        .unwrap();
    receiver.on_offer("alice@10.0.0.1", offer.clone()).unwrap();
    receiver.accept(&offer.file_id).unwrap();

    let start = Instant::now();
    let mut completed = None;
    for index in (0..offer.total_chunks).rev() {
        let (total, chunk) = sender.outgoing_chunk(&offer.file_id, index).unwrap();
        if let client::files::ChunkOutcome::Completed(file) =
            receiver.on_chunk(&offer.file_id, "alice@10.0.0.1", index, total, chunk)
        {
            completed = Some(file);
        }
    }

    let duration = start.elapsed();
    println!(
        "File reassembly: {} chunks in {:?}",
        offer.total_chunks, duration
    );
    assert_eq!(completed.unwrap().data, data);
    assert!(duration.as_secs() < 2);
}

/// Benchmarks complete games including win detection on every move
#[test]
fn benchmark_game_win_detection() {
    let iterations = 20_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut session = GameSession::new("g", "x@10.0.0.1", "o@10.0.0.2");
        session.activate();
        let mut outcome = None;
        for (i, pos) in [0, 1, 4, 2, 8].into_iter().enumerate() {
            let turn = i as u32 + 1;
            let symbol = Symbol::for_turn(turn);
            let player = session.player_for(symbol).to_string();
            outcome = session.apply_move(&player, symbol, pos, turn).unwrap();
        }
        assert!(outcome.is_some());
    }

    let duration = start.elapsed();
    println!(
        "Game simulation: {} games in {:?} ({:.2} μs/game)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );
    assert!(duration.as_secs() < 2);
}

/// Stress test for post fan-out selection with many followers
#[test]
fn stress_test_post_recipients() {
    let mut social = SocialRouter::new();
    let mut addrs = HashMap::new();
    for i in 0..2_000u16 {
        let id = format!("user{}@10.0.{}.{}", i, i / 250, i % 250);
        addrs.insert(id.clone(), SocketAddr::from(([10, 0, 0, 1], 10_000 + i)));
        if i % 2 == 0 {
            social.follow(&id, "alice@10.0.0.1", true).unwrap();
        }
    }

    let start = Instant::now();
    let recipients = social.post_recipients("alice@10.0.0.1", &addrs);
    let duration = start.elapsed();

    println!("Post fan-out: {} recipients in {:?}", recipients.len(), duration);
    assert_eq!(recipients.len(), 1_000);
    assert!(duration.as_millis() < 100);
}
