//! Integration tests for LSNP nodes and the rendezvous server
//!
//! Every test runs real sockets on 127.0.0.1 with ephemeral ports.

use client::{GameOutcome, GameStatus, Node, NodeConfig, NodeEvent, Symbol, TransferStatus};
use server::{Server, ServerConfig};
use shared::{field, Message, MessageKind, Scope, TokenAuthority, BUFFER_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

type Events = UnboundedReceiver<NodeEvent>;

/// Waits for the first event matching `pred`, skipping everything else
async fn wait_for<F>(events: &mut Events, mut pred: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Asserts that no event matching `pred` shows up for a short while
async fn assert_quiet<F>(events: &mut Events, mut pred: F)
where
    F: FnMut(&NodeEvent) -> bool,
{
    let _ = timeout(Duration::from_millis(400), async {
        while let Some(event) = events.recv().await {
            assert!(!pred(&event), "unexpected event {:?}", event);
        }
    })
    .await;
}

/// Next datagram on a raw socket, if one arrives within half a second
async fn recv_message(socket: &UdpSocket) -> Option<Message> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let (len, _) = timeout(Duration::from_millis(500), socket.recv_from(&mut buffer))
        .await
        .ok()?
        .ok()?;
    Message::parse(&buffer[..len]).ok()
}

async fn start_node(user: &str, server: Option<SocketAddr>) -> (Node, Events) {
    let config = NodeConfig {
        server,
        ..NodeConfig::loopback()
    };
    let (node, events) = Node::bind(config, user).await.unwrap();
    let runner = node.clone();
    tokio::spawn(async move { runner.run().await });
    (node, events)
}

/// Two peer-mode nodes that have discovered each other
async fn peer_pair() -> ((Node, Events), (Node, Events)) {
    let (a, mut a_events) = start_node("alice", None).await;
    let (b, mut b_events) = start_node("bob", None).await;

    a.announce_to(b.local_addr().unwrap()).await;
    wait_for(&mut b_events, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;
    wait_for(&mut a_events, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;

    ((a, a_events), (b, b_events))
}

async fn start_server() -> (Arc<Server>, SocketAddr) {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::bind(&config).await.unwrap());
    let addr = server.local_addr().unwrap();
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    (server, addr)
}

/// PEER DISCOVERY AND MESSAGING
mod peer_tests {
    use super::*;

    #[tokio::test]
    async fn discovery_is_mutual() {
        let ((a, _a_events), (b, _b_events)) = peer_pair().await;

        let a_peers = a.peers().await;
        assert_eq!(a_peers.len(), 1);
        assert_eq!(a_peers[0].user_id, "bob@127.0.0.1");
        assert_eq!(a.resolve("bob").await.as_deref(), Some("bob@127.0.0.1"));
        assert_eq!(b.peers().await[0].user_id, "alice@127.0.0.1");

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (b, mut b_events) = start_node("bob", None).await;
        let carol = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let ping = Message::new(MessageKind::Ping).with(field::USER_ID, "carol@127.0.0.1");
        carol
            .send_to(&ping.to_bytes(), b.local_addr().unwrap())
            .await
            .unwrap();

        let pong = recv_message(&carol).await.unwrap();
        assert_eq!(pong.kind(), Some(MessageKind::Pong));
        assert_eq!(pong.identity(), Some(b.user_id()));
        assert_eq!(pong.get(field::DISPLAY_NAME), Some("bob"));
        wait_for(&mut b_events, |e| {
            matches!(e, NodeEvent::PeerDiscovered { user_id, .. } if user_id == "carol@127.0.0.1")
        })
        .await;

        b.shutdown();
    }

    #[tokio::test]
    async fn direct_message_is_acknowledged() {
        let ((a, _a_events), (b, mut b_events)) = peer_pair().await;

        let message_id = a.send_dm(b.user_id(), "hello bob").await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;
        assert_eq!(
            event,
            NodeEvent::DirectMessage {
                from: "alice@127.0.0.1".to_string(),
                message_id,
                content: "hello bob".to_string(),
            }
        );

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn posts_reach_followers_only() {
        let ((a, mut a_events), (b, mut b_events)) = peer_pair().await;

        // Not followed yet: alice has no followers to send to
        a.post("before").await.unwrap();
        assert_quiet(&mut b_events, |e| matches!(e, NodeEvent::PostReceived { .. })).await;

        b.follow(a.user_id()).await.unwrap();
        wait_for(&mut a_events, |e| matches!(e, NodeEvent::Followed { .. })).await;
        assert_eq!(a.followers().await, vec!["bob@127.0.0.1".to_string()]);

        a.post("after").await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::PostReceived { .. })).await;
        match event {
            NodeEvent::PostReceived { author, content, .. } => {
                assert_eq!(author, "alice@127.0.0.1");
                assert_eq!(content, "after");
            }
            other => panic!("unexpected {:?}", other),
        }

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let (a, _events) = start_node("alice", None).await;
        assert_err!(a.send_dm("ghost@127.0.0.1", "boo").await);
        a.shutdown();
    }
}

/// FILE TRANSFER
mod file_tests {
    use super::*;

    #[tokio::test]
    async fn out_of_order_chunks_reassemble() {
        let ((a, mut a_events), (b, mut b_events)) = peer_pair().await;
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

        let offer = a
            .offer_file(b.user_id(), "notes.bin", "application/octet-stream", data.clone(), None)
            .await
            .unwrap();
        assert_eq!(offer.total_chunks, 3);
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::FileOffered { .. })).await;

        assert_ok!(b.accept_file(&offer.file_id).await);
        for index in [2, 0, 1] {
            a.send_chunk(&offer.file_id, index).await.unwrap();
        }

        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::FileReceived(_))).await;
        match event {
            NodeEvent::FileReceived(file) => {
                assert_eq!(file.filename, "notes.bin");
                assert_eq!(file.sender, "alice@127.0.0.1");
                assert_eq!(file.data, data);
            }
            other => panic!("unexpected {:?}", other),
        }

        let event = wait_for(&mut a_events, |e| matches!(e, NodeEvent::FileDelivered { .. })).await;
        assert_eq!(
            event,
            NodeEvent::FileDelivered {
                file_id: offer.file_id.clone(),
                status: TransferStatus::Complete,
            }
        );
        assert_eq!(
            b.transfer_status(&offer.file_id).await,
            Some(TransferStatus::Complete)
        );

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn ignored_offer_stops_the_sender() {
        let ((a, mut a_events), (b, mut b_events)) = peer_pair().await;

        let offer = a
            .offer_file(b.user_id(), "big.bin", "application/octet-stream", vec![7; 4096], None)
            .await
            .unwrap();
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::FileOffered { .. })).await;
        assert_ok!(b.ignore_file(&offer.file_id).await);

        let event = wait_for(&mut a_events, |e| matches!(e, NodeEvent::FileDelivered { .. })).await;
        assert_eq!(
            event,
            NodeEvent::FileDelivered {
                file_id: offer.file_id.clone(),
                status: TransferStatus::Ignored,
            }
        );
        assert_err!(a.send_chunk(&offer.file_id, 0).await);

        a.shutdown();
        b.shutdown();
    }
}

/// TIC-TAC-TOE
mod game_tests {
    use super::*;

    #[tokio::test]
    async fn diagonal_win_is_seen_by_both_players() {
        let ((a, _a_events), (b, mut b_events)) = peer_pair().await;

        let game_id = a.invite_game(b.user_id(), Symbol::X).await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GameInvited { .. })).await;
        assert_eq!(
            event,
            NodeEvent::GameInvited {
                game_id: game_id.clone(),
                from: "alice@127.0.0.1".to_string(),
                symbol: Symbol::O,
            }
        );

        assert_eq!(a.play_move(&game_id, 0).await.unwrap(), None);
        assert_eq!(b.play_move(&game_id, 1).await.unwrap(), None);
        assert_eq!(a.play_move(&game_id, 4).await.unwrap(), None);
        assert_eq!(b.play_move(&game_id, 2).await.unwrap(), None);
        let outcome = a.play_move(&game_id, 8).await.unwrap();

        let win = GameOutcome::Win {
            symbol: Symbol::X,
            line: [0, 4, 8],
        };
        assert_eq!(outcome, Some(win));
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GameOver { .. })).await;
        assert_eq!(
            event,
            NodeEvent::GameOver {
                game_id: game_id.clone(),
                outcome: win,
            }
        );
        assert_eq!(b.game(&game_id).await.unwrap().status(), GameStatus::Complete);

        // Out of turn after the game is over
        assert_err!(b.play_move(&game_id, 3).await);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn invitee_holding_x_can_move_first() {
        let ((a, _a_events), (b, mut b_events)) = peer_pair().await;

        let inviter = {
            let a = a.clone();
            let bob = b.user_id().to_string();
            tokio::spawn(async move { a.invite_game(&bob, Symbol::O).await })
        };
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GameInvited { .. })).await;
        let NodeEvent::GameInvited { game_id, symbol, .. } = event else {
            unreachable!()
        };
        assert_eq!(symbol, Symbol::X);
        assert_ok!(b.play_move(&game_id, 4).await);

        assert_eq!(inviter.await.unwrap().unwrap(), game_id);
        let session = a.game(&game_id).await.unwrap();
        assert_eq!(session.status(), GameStatus::Active);
        assert_eq!(session.turn(), 1);
        assert_eq!(session.board()[4], Some(Symbol::X));

        assert_ok!(a.play_move(&game_id, 0).await);
        assert_eq!(b.game(&game_id).await.unwrap().turn(), 2);
        assert_eq!(
            a.game(&game_id).await.unwrap().board(),
            b.game(&game_id).await.unwrap().board()
        );

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn rejected_moves_are_not_acknowledged() {
        let (b, _b_events) = start_node("bob", None).await;
        let b_addr = b.local_addr().unwrap();
        let carol = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let me = "carol@127.0.0.1";
        let token = TokenAuthority::new().issue(me, Scope::Game, 60);

        let game_move = |id: &str, game_id: &str| {
            Message::new(MessageKind::TictactoeMove)
                .with(field::FROM, me)
                .with(field::TO, b.user_id())
                .with(field::MESSAGE_ID, id)
                .with(field::GAMEID, game_id)
                .with(field::POSITION, "4")
                .with(field::SYMBOL, "X")
                .with(field::TURN, "1")
                .with(field::TOKEN, token.clone())
                .to_bytes()
        };

        carol.send_to(&game_move("m1", "nope"), b_addr).await.unwrap();
        assert!(recv_message(&carol).await.is_none());

        let invite = Message::new(MessageKind::TictactoeInvite)
            .with(field::FROM, me)
            .with(field::TO, b.user_id())
            .with(field::MESSAGE_ID, "i1")
            .with(field::GAMEID, "g1")
            .with(field::SYMBOL, "X")
            .with(field::TOKEN, token.clone());
        carol.send_to(&invite.to_bytes(), b_addr).await.unwrap();
        assert_eq!(recv_message(&carol).await.unwrap().message_id(), Some("i1"));

        // A retransmitted move is acknowledged again but applied once
        for _ in 0..2 {
            carol.send_to(&game_move("m2", "g1"), b_addr).await.unwrap();
            let ack = recv_message(&carol).await.unwrap();
            assert_eq!(ack.kind(), Some(MessageKind::Ack));
            assert_eq!(ack.message_id(), Some("m2"));
        }
        assert_eq!(b.game("g1").await.unwrap().turn(), 1);

        b.shutdown();
    }
}

/// RELAY SERVER
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn relayed_posts_reach_followers_only() {
        let (server, server_addr) = start_server().await;

        let (a, mut a_events) = start_node("alice", Some(server_addr)).await;
        wait_for(&mut a_events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        let (b, mut b_events) = start_node("bob", Some(server_addr)).await;
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        let (c, mut c_events) = start_node("carol", Some(server_addr)).await;
        let welcome = wait_for(&mut c_events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        assert_eq!(
            welcome,
            NodeEvent::Welcomed {
                peers: vec![
                    ("alice@127.0.0.1".to_string(), "alice".to_string()),
                    ("bob@127.0.0.1".to_string(), "bob".to_string()),
                ],
            }
        );

        b.follow(a.user_id()).await.unwrap();
        wait_for(&mut a_events, |e| matches!(e, NodeEvent::Followed { .. })).await;

        a.post("relayed hello").await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::PostReceived { .. })).await;
        assert!(matches!(
            event,
            NodeEvent::PostReceived { ref content, .. } if content == "relayed hello"
        ));
        assert_quiet(&mut c_events, |e| matches!(e, NodeEvent::PostReceived { .. })).await;

        assert_eq!(server.peers().await.len(), 3);
        a.shutdown();
        b.shutdown();
        c.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn relayed_group_message() {
        let (server, server_addr) = start_server().await;

        let (a, mut a_events) = start_node("alice", Some(server_addr)).await;
        wait_for(&mut a_events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        let (b, mut b_events) = start_node("bob", Some(server_addr)).await;
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        wait_for(&mut a_events, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;

        let group_id = a
            .create_group("friends", vec![b.user_id().to_string()])
            .await
            .unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GroupJoined { .. })).await;
        assert!(matches!(
            event,
            NodeEvent::GroupJoined { group_id: ref id, .. } if *id == group_id
        ));

        a.send_group_message(&group_id, "see you at 5").await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GroupMessage { .. })).await;
        assert_eq!(
            event,
            NodeEvent::GroupMessage {
                group_id,
                from: "alice@127.0.0.1".to_string(),
                content: "see you at 5".to_string(),
            }
        );

        a.shutdown();
        b.shutdown();
        server.shutdown();
    }
}

/// IDENTITY AND TOKEN ENFORCEMENT
mod security_tests {
    use super::*;

    async fn raw_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn dm(from: &str, to: &str, id: &str, token: Option<String>) -> Vec<u8> {
        let mut message = Message::new(MessageKind::Dm)
            .with(field::FROM, from)
            .with(field::TO, to)
            .with(field::MESSAGE_ID, id)
            .with(field::CONTENT, "psst");
        if let Some(token) = token {
            message.set(field::TOKEN, token);
        }
        message.to_bytes()
    }

    #[tokio::test]
    async fn only_authorized_messages_are_delivered() {
        let (b, mut b_events) = start_node("bob", None).await;
        let b_addr = b.local_addr().unwrap();
        let mallory = raw_socket().await;
        let me = "mallory@127.0.0.1";
        let mut tokens = TokenAuthority::new();

        // No token
        mallory.send_to(&dm(me, b.user_id(), "m1", None), b_addr).await.unwrap();
        // Wrong scope
        let wrong = tokens.issue(me, Scope::Broadcast, 60);
        mallory
            .send_to(&dm(me, b.user_id(), "m2", Some(wrong)), b_addr)
            .await
            .unwrap();
        // Someone else's token
        let stolen = tokens.issue("alice@127.0.0.1", Scope::Chat, 60);
        mallory
            .send_to(&dm(me, b.user_id(), "m3", Some(stolen)), b_addr)
            .await
            .unwrap();
        // Spoofed identity
        let spoofed = tokens.issue("alice@10.9.9.9", Scope::Chat, 60);
        mallory
            .send_to(&dm("alice@10.9.9.9", b.user_id(), "m4", Some(spoofed)), b_addr)
            .await
            .unwrap();
        assert_quiet(&mut b_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;
        assert!(recv_message(&mallory).await.is_none());

        let valid = tokens.issue(me, Scope::Chat, 60);
        mallory
            .send_to(&dm(me, b.user_id(), "m5", Some(valid)), b_addr)
            .await
            .unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;
        assert!(matches!(event, NodeEvent::DirectMessage { ref from, .. } if from == me));

        let ack = recv_message(&mallory).await.unwrap();
        assert_eq!(ack.kind(), Some(MessageKind::Ack));
        assert_eq!(ack.message_id(), Some("m5"));

        b.shutdown();
    }

    #[tokio::test]
    async fn revoked_token_is_refused() {
        let (b, mut b_events) = start_node("bob", None).await;
        let b_addr = b.local_addr().unwrap();
        let mallory = raw_socket().await;
        let me = "mallory@127.0.0.1";

        let token = TokenAuthority::new().issue(me, Scope::Chat, 60);
        let revoke = Message::new(MessageKind::Revoke)
            .with(field::FROM, me)
            .with(field::TOKEN, token.clone());
        mallory.send_to(&revoke.to_bytes(), b_addr).await.unwrap();
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::TokenRevoked { .. })).await;

        mallory
            .send_to(&dm(me, b.user_id(), "m1", Some(token)), b_addr)
            .await
            .unwrap();
        assert_quiet(&mut b_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;

        b.shutdown();
    }

    #[tokio::test]
    async fn group_cannot_be_taken_over_by_another_creator() {
        let ((a, _a_events), (b, mut b_events)) = peer_pair().await;
        let group_id = a
            .create_group("friends", vec![b.user_id().to_string()])
            .await
            .unwrap();
        wait_for(&mut b_events, |e| matches!(e, NodeEvent::GroupJoined { .. })).await;

        let mallory = raw_socket().await;
        let me = "mallory@127.0.0.1";
        let takeover = Message::new(MessageKind::GroupCreate)
            .with(field::FROM, me)
            .with(field::TO, b.user_id())
            .with(field::MESSAGE_ID, "steal")
            .with(field::GROUP_ID, group_id.clone())
            .with(field::GROUP_NAME, "mine now")
            .with(field::MEMBERS, me)
            .with(field::TOKEN, TokenAuthority::new().issue(me, Scope::Group, 60));
        mallory
            .send_to(&takeover.to_bytes(), b.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(recv_message(&mallory).await.unwrap().message_id(), Some("steal"));

        let missed = a.send_group_message(&group_id, "still ours").await.unwrap();
        assert!(missed.is_empty());
        let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::GroupMessage { .. })).await;
        assert!(matches!(
            event,
            NodeEvent::GroupMessage { ref from, ref content, .. }
                if from == a.user_id() && content == "still ours"
        ));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn posts_from_unfollowed_authors_are_dropped() {
        let (b, mut b_events) = start_node("bob", None).await;
        let mallory = raw_socket().await;
        let me = "mallory@127.0.0.1";

        let post = Message::new(MessageKind::Post)
            .with(field::FROM, me)
            .with(field::MESSAGE_ID, "p1")
            .with(field::CONTENT, "buy now")
            .with(field::TOKEN, TokenAuthority::new().issue(me, Scope::Broadcast, 60));
        mallory
            .send_to(&post.to_bytes(), b.local_addr().unwrap())
            .await
            .unwrap();
        assert_quiet(&mut b_events, |e| matches!(e, NodeEvent::PostReceived { .. })).await;

        b.shutdown();
    }
}
