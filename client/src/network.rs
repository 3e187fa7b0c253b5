//! LSNP node: socket ownership, background tasks and the outbound API
//!
//! A [`Node`] is a cheap handle around shared state. [`Node::run`] drives the
//! receive loop (one spawned task per datagram, see `dispatch`) together with
//! the periodic presence, liveness and transfer cleanup tasks until
//! [`Node::shutdown`] is called. Every table lives behind its own lock and no
//! guard is held across a socket send.

use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::files::{FileError, FileOffer, FileTransferManager, TransferProgress, TransferStatus};
use crate::game::{GameError, GameOutcome, GameSession, GameTable, Symbol};
use crate::reliable::{DeliveryError, ReliableSender};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::join_all;
use log::{debug, error, info, warn};
use shared::{
    field, new_message_id, unix_now, CodecError, Directory, DirectoryError, Message,
    MessageKind, PeerSnapshot, Scope, SocialError, SocialRouter, TokenAuthority, TokenError,
    BUFFER_SIZE,
};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unauthorized: {0}")]
    Token(#[from] TokenError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Social(#[from] SocialError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("invalid peer list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid chunk data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unknown recipient {0}")]
    UnknownRecipient(String),
}

/// How a node reaches other peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// LAN broadcast for presence, unicast to observed addresses otherwise
    Peer,
    /// Everything goes through a rendezvous server
    Relay(SocketAddr),
}

/// Recently seen message ids, oldest forgotten first
pub(crate) struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when the id was already seen
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

pub(crate) struct NodeInner {
    pub(crate) socket: UdpSocket,
    pub(crate) me: String,
    pub(crate) display_name: String,
    pub(crate) config: NodeConfig,
    pub(crate) mode: Mode,
    pub(crate) tokens: Mutex<TokenAuthority>,
    pub(crate) directory: Mutex<Directory>,
    pub(crate) social: Mutex<SocialRouter>,
    pub(crate) files: Mutex<FileTransferManager>,
    pub(crate) games: Mutex<GameTable>,
    pub(crate) seen: Mutex<SeenIds>,
    pub(crate) reliable: ReliableSender,
    pub(crate) events: mpsc::UnboundedSender<NodeEvent>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

/// Handle to a running or runnable LSNP node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Best guess at the LAN address of this host; no packet is sent
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

impl Node {
    /// Binds the socket and builds all registries; nothing runs until [`Node::run`]
    pub async fn bind(
        config: NodeConfig,
        user: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let socket = UdpSocket::bind(config.bind).await?;
        let mode = match config.server {
            Some(server) => Mode::Relay(server),
            None => {
                socket.set_broadcast(true)?;
                Mode::Peer
            }
        };

        let ip = match config.identity_ip() {
            ip if ip.is_unspecified() => {
                detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
            }
            ip => ip,
        };
        let me = shared::identity(user, ip);
        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| user.to_string());
        info!(
            "Node {} listening on {} ({:?})",
            me,
            socket.local_addr()?,
            mode
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = NodeInner {
            tokens: Mutex::new(TokenAuthority::new()),
            directory: Mutex::new(Directory::new(config.liveness_timeout(), config.max_peers)),
            social: Mutex::new(SocialRouter::new()),
            files: Mutex::new(FileTransferManager::new(
                config.file_inactivity(),
                config.file_retention(),
                config.max_file_size,
            )),
            games: Mutex::new(GameTable::new()),
            seen: Mutex::new(SeenIds::new(4096)),
            reliable: ReliableSender::new(),
            socket,
            me,
            display_name,
            config,
            mode,
            events,
            shutdown_tx,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.inner.me
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Runs the receive loop and background tasks until shutdown
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        self.inner.announce().await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        match self.inner.mode {
            Mode::Peer => {
                tasks.push(self.spawn_periodic(self.inner.config.presence_interval(), |inner| async move {
                    inner.announce().await
                }));
                tasks.push(self.spawn_periodic(self.inner.config.sweep_interval(), |inner| async move {
                    inner.sweep_presence().await
                }));
            }
            Mode::Relay(_) => {
                tasks.push(self.spawn_periodic(self.inner.config.heartbeat_interval(), |inner| async move {
                    inner.heartbeat().await
                }));
            }
        }
        tasks.push(self.spawn_periodic(self.inner.config.sweep_interval(), |inner| async move {
            inner.sweep_transfers().await
        }));

        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                result = self.inner.socket.recv_from(&mut buffer) => match result {
                    Ok((len, source)) => {
                        let raw = buffer[..len].to_vec();
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            inner.handle_datagram(&raw, source).await;
                        });
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Node {} shutting down", self.inner.me);
                    break;
                }
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// Stops the receive loop, background tasks and in-flight reliable sends
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, mut task: F) -> JoinHandle<()>
    where
        F: FnMut(Arc<NodeInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task(Arc::clone(&inner)).await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Broadcasts presence (peer mode) or registers with the server (relay mode)
    pub async fn announce(&self) {
        self.inner.announce().await;
    }

    /// Sends our PROFILE straight to one address
    pub async fn announce_to(&self, addr: SocketAddr) {
        self.inner.announce_to(addr).await;
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.inner.directory.lock().await.snapshot()
    }

    /// Resolves a full identity or a display/short name to a known identity
    pub async fn resolve(&self, name: &str) -> Option<String> {
        let directory = self.inner.directory.lock().await;
        if directory.contains(name) {
            return Some(name.to_string());
        }
        directory.find_by_name(name).map(str::to_string)
    }

    pub async fn following(&self) -> Vec<String> {
        self.inner.social.lock().await.following_of(&self.inner.me)
    }

    pub async fn followers(&self) -> Vec<String> {
        self.inner.social.lock().await.followers_of(&self.inner.me)
    }

    /// Publishes a post to followers; returns its MESSAGE_ID
    pub async fn post(&self, content: &str) -> Result<String, NodeError> {
        let inner = &self.inner;
        let message_id = new_message_id();
        let message = Message::new(MessageKind::Post)
            .with(field::FROM, inner.me.clone())
            .with(field::MESSAGE_ID, message_id.clone())
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TTL, inner.config.token_ttl_secs.to_string())
            .with(field::CONTENT, content)
            .with(field::TOKEN, inner.token(Scope::Broadcast).await);

        match inner.mode {
            Mode::Relay(server) => inner.send_raw(&message, server).await,
            Mode::Peer => {
                let recipients = {
                    let addrs = inner.directory.lock().await.addrs();
                    inner.social.lock().await.post_recipients(&inner.me, &addrs)
                };
                debug!("Post {} goes to {} followers", message_id, recipients.len());
                for (_, addr) in recipients {
                    inner.send_raw(&message, addr).await;
                }
            }
        }
        Ok(message_id)
    }

    pub async fn like(&self, author: &str, post_timestamp: &str) -> Result<(), NodeError> {
        let dest = self.inner.destination(author).await?;
        let message = Message::new(MessageKind::Like)
            .with(field::FROM, self.inner.me.clone())
            .with(field::TO, author)
            .with(field::POST_TIMESTAMP, post_timestamp)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, self.inner.token(Scope::Broadcast).await);
        self.inner.send_raw(&message, dest).await;
        Ok(())
    }

    pub async fn send_dm(&self, to: &str, content: &str) -> Result<String, NodeError> {
        let dest = self.inner.destination(to).await?;
        let message = Message::new(MessageKind::Dm)
            .with(field::FROM, self.inner.me.clone())
            .with(field::TO, to)
            .with(field::CONTENT, content)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, self.inner.token(Scope::Chat).await);
        self.inner.send_reliable(message, dest, to).await
    }

    pub async fn follow(&self, target: &str) -> Result<(), NodeError> {
        let inner = &self.inner;
        let dest = inner.destination(target).await?;
        inner.social.lock().await.follow(&inner.me, target, true)?;

        let message = Message::new(MessageKind::Follow)
            .with(field::FROM, inner.me.clone())
            .with(field::TO, target)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Follow).await);
        if let Err(e) = inner.send_reliable(message, dest, target).await {
            // Undelivered follow leaves no edge so it can be retried
            let _ = inner.social.lock().await.unfollow(&inner.me, target);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unfollow(&self, target: &str) -> Result<(), NodeError> {
        let inner = &self.inner;
        let dest = inner.destination(target).await?;
        inner.social.lock().await.unfollow(&inner.me, target)?;

        let message = Message::new(MessageKind::Unfollow)
            .with(field::FROM, inner.me.clone())
            .with(field::TO, target)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Follow).await);
        inner.send_reliable(message, dest, target).await?;
        Ok(())
    }

    /// Announces a file to `to`; chunks follow via [`Node::stream_file`]
    pub async fn offer_file(
        &self,
        to: &str,
        filename: &str,
        filetype: &str,
        data: Vec<u8>,
        description: Option<String>,
    ) -> Result<FileOffer, NodeError> {
        let inner = &self.inner;
        let dest = inner.destination(to).await?;
        let offer = inner.files.lock().await.offer(
            to,
            filename,
            filetype,
            data,
            inner.config.chunk_size,
            description,
        )?;

        let message = offer
            .to_message()
            .with(field::FROM, inner.me.clone())
            .with(field::TO, to)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::File).await);
        inner.send_reliable(message, dest, to).await?;
        Ok(offer)
    }

    /// Sends one chunk of an offered file
    pub async fn send_chunk(&self, file_id: &str, index: u32) -> Result<(), NodeError> {
        let inner = &self.inner;
        let (to, total, bytes) = {
            let mut files = inner.files.lock().await;
            let to = files
                .recipient_of(file_id)
                .ok_or_else(|| FileError::UnknownTransfer(file_id.to_string()))?
                .to_string();
            let (total, bytes) = files.outgoing_chunk(file_id, index)?;
            (to, total, bytes)
        };
        let dest = inner.destination(&to).await?;

        let message = Message::new(MessageKind::FileChunk)
            .with(field::FROM, inner.me.clone())
            .with(field::TO, to.clone())
            .with(field::FILEID, file_id)
            .with(field::CHUNK_INDEX, index.to_string())
            .with(field::TOTAL_CHUNKS, total.to_string())
            .with(field::CHUNK_SIZE, bytes.len().to_string())
            .with(field::DATA, BASE64.encode(&bytes))
            .with(field::TOKEN, inner.token(Scope::File).await);
        inner.send_reliable(message, dest, &to).await?;
        Ok(())
    }

    /// Sends every chunk in order, stopping early if the recipient ignored the file
    pub async fn stream_file(&self, file_id: &str) -> Result<(), NodeError> {
        let total = self
            .inner
            .files
            .lock()
            .await
            .progress(file_id)
            .map(|p| p.total)
            .ok_or_else(|| FileError::UnknownTransfer(file_id.to_string()))?;

        for index in 0..total {
            let status = self.inner.files.lock().await.status(file_id);
            if status != Some(TransferStatus::Offered) {
                info!("Stopping transfer of {} ({:?})", file_id, status);
                break;
            }
            self.send_chunk(file_id, index).await?;
        }
        Ok(())
    }

    /// Offer, short pause for the recipient to decide, then stream
    pub async fn send_file(
        &self,
        to: &str,
        filename: &str,
        filetype: &str,
        data: Vec<u8>,
        description: Option<String>,
    ) -> Result<String, NodeError> {
        let offer = self
            .offer_file(to, filename, filetype, data, description)
            .await?;
        tokio::time::sleep(self.inner.config.offer_lead()).await;
        self.stream_file(&offer.file_id).await?;
        Ok(offer.file_id)
    }

    pub async fn accept_file(&self, file_id: &str) -> Result<(), NodeError> {
        self.inner.accept_file(file_id).await
    }

    pub async fn ignore_file(&self, file_id: &str) -> Result<(), NodeError> {
        let sender = self.inner.files.lock().await.ignore(file_id)?;
        match self.inner.destination(&sender).await {
            Ok(dest) => {
                self.inner
                    .send_file_receipt(file_id, &sender, TransferStatus::Ignored, dest)
                    .await
            }
            Err(e) => debug!("Cannot tell {} about ignored file: {}", sender, e),
        }
        Ok(())
    }

    pub async fn transfers(&self) -> Vec<TransferProgress> {
        self.inner.files.lock().await.transfers()
    }

    pub async fn transfer_status(&self, file_id: &str) -> Option<TransferStatus> {
        self.inner.files.lock().await.status(file_id)
    }

    /// Invites `to` to a game; the session becomes ACTIVE once the invite is
    /// acknowledged or the invitee makes the first move
    pub async fn invite_game(&self, to: &str, symbol: Symbol) -> Result<String, NodeError> {
        let inner = &self.inner;
        let dest = inner.destination(to).await?;
        let game_id = new_message_id();
        let (player_x, player_o) = match symbol {
            Symbol::X => (inner.me.clone(), to.to_string()),
            Symbol::O => (to.to_string(), inner.me.clone()),
        };
        inner.games.lock().await.create(&game_id, &player_x, &player_o);

        let message = Message::new(MessageKind::TictactoeInvite)
            .with(field::FROM, inner.me.clone())
            .with(field::TO, to)
            .with(field::GAMEID, game_id.clone())
            .with(field::PLAYER_X, player_x)
            .with(field::PLAYER_O, player_o)
            .with(field::SYMBOL, symbol.to_string())
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Game).await);

        match inner.send_reliable(message, dest, to).await {
            Ok(_) => {
                inner.games.lock().await.activate(&game_id)?;
                info!("Game {} with {} is on", game_id, to);
                Ok(game_id)
            }
            Err(e) => {
                if inner.games.lock().await.withdraw(&game_id) {
                    return Err(e);
                }
                // The invitee already moved, so the invite did arrive
                debug!("Invite {} unacknowledged but game is on: {}", game_id, e);
                Ok(game_id)
            }
        }
    }

    /// Plays the local player's next move and tells the opponent
    ///
    /// The move is taken back if the opponent cannot be reached.
    pub async fn play_move(
        &self,
        game_id: &str,
        position: usize,
    ) -> Result<Option<GameOutcome>, NodeError> {
        let inner = &self.inner;
        let opponent = inner
            .games
            .lock()
            .await
            .get(game_id)
            .ok_or_else(|| GameError::UnknownGame(game_id.to_string()))?
            .opponent_of(&inner.me)
            .map(str::to_string)
            .ok_or_else(|| GameError::NotParticipant(inner.me.clone()))?;
        let dest = inner.destination(&opponent).await?;
        let (mv, outcome) = inner.games.lock().await.play(game_id, &inner.me, position)?;

        let message = Message::new(MessageKind::TictactoeMove)
            .with(field::FROM, inner.me.clone())
            .with(field::TO, opponent.clone())
            .with(field::GAMEID, game_id)
            .with(field::POSITION, mv.position.to_string())
            .with(field::SYMBOL, mv.symbol.to_string())
            .with(field::TURN, mv.turn.to_string())
            .with(field::TOKEN, inner.token(Scope::Game).await);
        if let Err(e) = inner.send_reliable(message, dest, &opponent).await {
            inner.games.lock().await.undo(game_id, mv.turn);
            warn!("Move {} in game {} taken back: {}", mv.turn, game_id, e);
            return Err(e);
        }

        if let Some(outcome) = outcome {
            let symbol = match outcome {
                GameOutcome::Win { symbol, .. } => symbol,
                GameOutcome::Draw => mv.symbol,
            };
            let result = Message::new(MessageKind::TictactoeResult)
                .with(field::FROM, inner.me.clone())
                .with(field::TO, opponent.clone())
                .with(field::GAMEID, game_id)
                .with(field::RESULT, outcome.result_tag())
                .with(field::SYMBOL, symbol.to_string())
                .with(field::WINNING_LINE, outcome.line_field())
                .with(field::TIMESTAMP, unix_now().to_string())
                .with(field::TOKEN, inner.token(Scope::Game).await);
            if let Err(e) = inner.send_reliable(result, dest, &opponent).await {
                warn!("Result of game {} not confirmed by {}: {}", game_id, opponent, e);
            }
            inner.emit(NodeEvent::GameOver {
                game_id: game_id.to_string(),
                outcome,
            });
        }
        Ok(outcome)
    }

    pub async fn game(&self, game_id: &str) -> Option<GameSession> {
        self.inner.games.lock().await.get(game_id).cloned()
    }

    pub async fn create_group(&self, name: &str, members: Vec<String>) -> Result<String, NodeError> {
        let inner = &self.inner;
        let group_id = new_message_id();
        let member_list = {
            let mut social = inner.social.lock().await;
            social.create_group(&group_id, name, &inner.me, members)?;
            social
                .group(&group_id)
                .map(|group| group.member_list())
                .unwrap_or_default()
        };

        let message = Message::new(MessageKind::GroupCreate)
            .with(field::FROM, inner.me.clone())
            .with(field::GROUP_ID, group_id.clone())
            .with(field::GROUP_NAME, name)
            .with(field::MEMBERS, member_list)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Group).await);
        let recipients = inner.group_recipients(&group_id, &[]).await?;
        inner.fan_out(message, recipients).await;
        Ok(group_id)
    }

    pub async fn update_group(
        &self,
        group_id: &str,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<(), NodeError> {
        let inner = &self.inner;
        inner
            .social
            .lock()
            .await
            .update_group(group_id, &add, &remove, None)?;

        let mut message = Message::new(MessageKind::GroupUpdate)
            .with(field::FROM, inner.me.clone())
            .with(field::GROUP_ID, group_id)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Group).await);
        if !add.is_empty() {
            message.set(field::ADD, add.join(","));
        }
        if !remove.is_empty() {
            message.set(field::REMOVE, remove.join(","));
        }
        let recipients = inner.group_recipients(group_id, &remove).await?;
        inner.fan_out(message, recipients).await;
        Ok(())
    }

    /// Sends to every addressable member; returns those that did not acknowledge
    pub async fn send_group_message(
        &self,
        group_id: &str,
        content: &str,
    ) -> Result<Vec<String>, NodeError> {
        let inner = &self.inner;
        let recipients = inner.group_recipients(group_id, &[]).await?;
        let message = Message::new(MessageKind::GroupMessage)
            .with(field::FROM, inner.me.clone())
            .with(field::GROUP_ID, group_id)
            .with(field::CONTENT, content)
            .with(field::TIMESTAMP, unix_now().to_string())
            .with(field::TOKEN, inner.token(Scope::Group).await);
        Ok(inner.fan_out(message, recipients).await)
    }

    /// Revokes a token locally and tells everyone reachable
    pub async fn revoke_token(&self, token: &str) {
        let inner = &self.inner;
        inner.tokens.lock().await.revoke(token);
        let message = Message::new(MessageKind::Revoke)
            .with(field::FROM, inner.me.clone())
            .with(field::TOKEN, token);
        inner.send_raw(&message, inner.broadcast_addr()).await;
    }
}

impl NodeInner {
    pub(crate) fn emit(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub(crate) async fn token(&self, scope: Scope) -> String {
        self.tokens
            .lock()
            .await
            .issue(&self.me, scope, self.config.token_ttl_secs)
    }

    /// Where datagrams for `user_id` should be sent
    pub(crate) async fn destination(&self, user_id: &str) -> Result<SocketAddr, NodeError> {
        let known = self.directory.lock().await.addr_of(user_id);
        match (self.mode, known) {
            (Mode::Relay(server), Some(_)) => Ok(server),
            (Mode::Peer, Some(addr)) => Ok(addr),
            (_, None) => Err(NodeError::UnknownRecipient(user_id.to_string())),
        }
    }

    pub(crate) fn broadcast_addr(&self) -> SocketAddr {
        match self.mode {
            Mode::Relay(server) => server,
            Mode::Peer => self.config.broadcast_addr,
        }
    }

    /// Best-effort send; failures are logged only
    pub(crate) async fn send_raw(&self, message: &Message, dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(&message.to_bytes(), dest).await {
            warn!("Failed to send {} to {}: {}", message.type_tag(), dest, e);
        }
    }

    pub(crate) async fn send_reliable(
        &self,
        message: Message,
        dest: SocketAddr,
        to: &str,
    ) -> Result<String, NodeError> {
        let result = self
            .reliable
            .send(
                &self.socket,
                message,
                dest,
                self.config.retry_policy(),
                self.shutdown_tx.subscribe(),
            )
            .await;
        match result {
            Ok(message_id) => Ok(message_id),
            Err(e) => {
                if let DeliveryError::Exhausted { message_id, .. } = &e {
                    self.emit(NodeEvent::DeliveryFailed {
                        message_id: message_id.clone(),
                        to: to.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Group members to reach, plus any `extra` ids (e.g. just-removed members)
    pub(crate) async fn group_recipients(
        &self,
        group_id: &str,
        extra: &[String],
    ) -> Result<Vec<(String, SocketAddr)>, NodeError> {
        let addrs = self.directory.lock().await.addrs();
        let mut recipients = self
            .social
            .lock()
            .await
            .group_recipients(group_id, &self.me, &addrs)?;
        for id in extra {
            if let Some(addr) = addrs.get(id) {
                if id != &self.me && !recipients.iter().any(|(r, _)| r == id) {
                    recipients.push((id.clone(), *addr));
                }
            }
        }
        Ok(recipients)
    }

    /// Reliable fan-out: one copy per recipient, or a single copy to the server
    ///
    /// Peer copies are delivered concurrently. Returns the recipients that
    /// did not acknowledge.
    pub(crate) async fn fan_out(
        &self,
        message: Message,
        recipients: Vec<(String, SocketAddr)>,
    ) -> Vec<String> {
        match self.mode {
            Mode::Relay(server) => {
                let kind = message.type_tag().to_string();
                match self.send_reliable(message, server, "server").await {
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!("Server did not take {}: {}", kind, e);
                        vec!["server".to_string()]
                    }
                }
            }
            Mode::Peer => {
                let sends = recipients.into_iter().map(|(member, addr)| {
                    let copy = message.clone().with(field::TO, member.clone());
                    async move {
                        let result = self.send_reliable(copy, addr, &member).await;
                        (member, result)
                    }
                });
                let mut failed = Vec::new();
                for (member, result) in join_all(sends).await {
                    if let Err(e) = result {
                        warn!("Group delivery to {} failed: {}", member, e);
                        failed.push(member);
                    }
                }
                failed
            }
        }
    }

    fn profile_message(&self) -> Message {
        Message::new(MessageKind::Profile)
            .with(field::USER_ID, self.me.clone())
            .with(field::DISPLAY_NAME, self.display_name.clone())
            .with(field::STATUS, self.config.status.clone())
    }

    pub(crate) async fn announce(&self) {
        match self.mode {
            Mode::Peer => {
                let ping = Message::new(MessageKind::Ping).with(field::USER_ID, self.me.clone());
                let dest = self.config.broadcast_addr;
                self.send_raw(&ping, dest).await;
                self.send_raw(&self.profile_message(), dest).await;
            }
            Mode::Relay(server) => {
                let register = Message::new(MessageKind::Register)
                    .with(field::USER_ID, self.me.clone())
                    .with(field::DISPLAY_NAME, self.display_name.clone());
                self.send_raw(&register, server).await;
            }
        }
    }

    pub(crate) async fn announce_to(&self, addr: SocketAddr) {
        self.send_raw(&self.profile_message(), addr).await;
    }

    /// Unicast reply to a PING
    pub(crate) async fn pong(&self, addr: SocketAddr) {
        let pong = Message::new(MessageKind::Pong)
            .with(field::USER_ID, self.me.clone())
            .with(field::DISPLAY_NAME, self.display_name.clone())
            .with(field::STATUS, self.config.status.clone());
        self.send_raw(&pong, addr).await;
    }

    async fn heartbeat(&self) {
        if let Mode::Relay(server) = self.mode {
            let heartbeat = Message::new(MessageKind::Heartbeat)
                .with(field::USER_ID, self.me.clone())
                .with(field::TIMESTAMP, unix_now().to_string());
            self.send_raw(&heartbeat, server).await;
        }
    }

    async fn sweep_presence(&self) {
        let evicted = self.directory.lock().await.sweep(Instant::now());
        if evicted.is_empty() {
            return;
        }
        let social = self.social.lock().await;
        for user_id in evicted {
            social.on_peer_evicted(&user_id);
            self.emit(NodeEvent::PeerLost { user_id });
        }
    }

    async fn sweep_transfers(&self) {
        let report = self.files.lock().await.sweep(Instant::now());
        for file_id in report.failed {
            self.emit(NodeEvent::FileFailed { file_id });
        }
        let purged = self.tokens.lock().await.purge_issued(unix_now());
        if purged > 0 {
            debug!("Purged {} expired tokens", purged);
        }
    }

    pub(crate) async fn accept_file(&self, file_id: &str) -> Result<(), NodeError> {
        let completed = self.files.lock().await.accept(file_id)?;
        if let Some(file) = completed {
            let reply = self.destination(&file.sender).await.ok();
            self.finish_file(file, reply).await;
        }
        Ok(())
    }

    pub(crate) async fn send_file_receipt(
        &self,
        file_id: &str,
        sender: &str,
        status: TransferStatus,
        dest: SocketAddr,
    ) {
        let receipt = Message::new(MessageKind::FileReceived)
            .with(field::FROM, self.me.clone())
            .with(field::TO, sender)
            .with(field::FILEID, file_id)
            .with(field::STATUS, status.as_str())
            .with(field::TIMESTAMP, unix_now().to_string());
        self.send_raw(&receipt, dest).await;
    }

    /// Confirms a completed file to its sender, stores it and reports it
    pub(crate) async fn finish_file(
        &self,
        file: crate::files::CompletedFile,
        reply: Option<SocketAddr>,
    ) {
        if let Some(dest) = reply {
            self.send_file_receipt(&file.file_id, &file.sender, TransferStatus::Complete, dest)
                .await;
        }
        if let Some(dir) = &self.config.download_dir {
            match store_download(dir, &file).await {
                Ok(path) => info!("Saved {} to {}", file.filename, path.display()),
                Err(e) => error!("Could not save {}: {}", file.filename, e),
            }
        }
        self.emit(NodeEvent::FileReceived(file));
    }
}

async fn store_download(dir: &Path, file: &crate::files::CompletedFile) -> std::io::Result<PathBuf> {
    let name = Path::new(&file.filename)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| file.file_id.clone().into());
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}
