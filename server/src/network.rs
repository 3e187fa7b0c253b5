//! Rendezvous server: registration, liveness and message relay
//!
//! Every datagram is handled in its own task. Registries sit behind separate
//! `RwLock`s and no guard is held across a socket send. Datagrams are relayed
//! byte for byte, so the original sender identity and token reach the
//! recipient untouched.

use crate::config::{ServerConfig, ServerError};
use log::{debug, error, info, warn};
use shared::message::split_list;
use shared::{
    field, unix_now, Directory, Message, MessageKind, PeerSnapshot, SocialError, SocialRouter,
    Token, TokenAuthority, BUFFER_SIZE,
};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;

struct ServerState {
    socket: UdpSocket,
    directory: RwLock<Directory>,
    social: RwLock<SocialRouter>,
    tokens: RwLock<TokenAuthority>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Server {
    state: Arc<ServerState>,
    sweep_interval: Duration,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind).await?;
        info!("Server listening on {}", socket.local_addr()?);

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Server {
            state: Arc::new(ServerState {
                socket,
                directory: RwLock::new(Directory::new(
                    config.liveness_timeout(),
                    config.max_peers,
                )),
                social: RwLock::new(SocialRouter::new()),
                tokens: RwLock::new(TokenAuthority::new()),
                shutdown_tx,
            }),
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.state.socket.local_addr()?)
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.state.directory.read().await.snapshot()
    }

    /// Receives and relays until [`Server::shutdown`] is called
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown = self.state.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        let sweeper = self.spawn_liveness_sweeper();

        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                result = self.state.socket.recv_from(&mut buffer) => match result {
                    Ok((len, source)) => {
                        let raw = buffer[..len].to_vec();
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            state.handle_datagram(&raw, source).await;
                        });
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        if let Err(e) = sweeper.await {
            warn!("Liveness sweeper ended abnormally: {}", e);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.state.shutdown_tx.send_replace(true);
    }

    /// Evicts peers that stopped sending heartbeats
    fn spawn_liveness_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let period = self.sweep_interval;
        let mut shutdown = state.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = state.directory.write().await.sweep(Instant::now());
                        if evicted.is_empty() {
                            continue;
                        }
                        let social = state.social.read().await;
                        for user_id in &evicted {
                            social.on_peer_evicted(user_id);
                        }
                        info!("Evicted {} silent peers", evicted.len());
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl ServerState {
    async fn handle_datagram(&self, raw: &[u8], source: SocketAddr) {
        let Ok(message) = Message::parse_from(raw, source) else {
            debug!("Dropping malformed datagram from {}", source);
            return;
        };
        let Some(kind) = message.kind() else {
            debug!("Unhandled message type {} from {}", message.type_tag(), source);
            return;
        };
        let Some(sender) = message.identity().map(str::to_string) else {
            debug!("{} from {} carries no identity", kind, source);
            return;
        };

        if let Some(scope) = kind.required_scope() {
            let authorized = match message.get(field::TOKEN) {
                Some(token) => self.tokens.read().await.validate(token, scope, &sender),
                None => {
                    debug!("{} from {} carries no token", kind, sender);
                    return;
                }
            };
            if let Err(e) = authorized {
                debug!("Rejecting {} from {}: {}", kind, sender, e);
                return;
            }
        }

        if kind != MessageKind::Register && !self.directory.write().await.touch(&sender, source) {
            debug!("{} from unregistered {} at {}", kind, sender, source);
            return;
        }

        match kind {
            MessageKind::Register => self.on_register(&message, &sender, source).await,
            MessageKind::Heartbeat | MessageKind::Ping | MessageKind::Pong => {}
            MessageKind::Profile => self.on_profile(raw, &message, &sender, source).await,
            MessageKind::Post => self.on_post(raw, &sender).await,
            MessageKind::Follow => self.on_follow(&message, &sender, source).await,
            MessageKind::Unfollow => self.on_unfollow(raw, &message, &sender, source).await,
            MessageKind::GroupCreate => self.on_group_create(raw, &message, &sender, source).await,
            MessageKind::GroupUpdate => self.on_group_update(raw, &message, &sender, source).await,
            MessageKind::GroupMessage => {
                self.on_group_message(raw, &message, &sender, source).await
            }
            MessageKind::Revoke => self.on_revoke(raw, &message, &sender).await,
            MessageKind::Dm
            | MessageKind::Like
            | MessageKind::FileOffer
            | MessageKind::FileChunk
            | MessageKind::FileReceived
            | MessageKind::TictactoeInvite
            | MessageKind::TictactoeMove
            | MessageKind::TictactoeResult
            | MessageKind::Ack => self.route_to_recipient(raw, kind, &message, &sender).await,
            MessageKind::Welcome | MessageKind::PeerJoined | MessageKind::FollowNotify => {
                debug!("Ignoring server-originated {} from {}", kind, sender);
            }
        }
    }

    async fn send(&self, bytes: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, dest).await {
            warn!("Failed to send to {}: {}", dest, e);
        }
    }

    async fn forward(&self, raw: &[u8], dests: impl IntoIterator<Item = SocketAddr>) {
        for dest in dests {
            self.send(raw, dest).await;
        }
    }

    /// Addresses of every registered peer except `exclude`
    async fn others(&self, exclude: &str) -> Vec<SocketAddr> {
        self.directory
            .read()
            .await
            .addrs()
            .into_iter()
            .filter(|(id, _)| id != exclude)
            .map(|(_, addr)| addr)
            .collect()
    }

    async fn ack(&self, message: &Message, sender: &str, dest: SocketAddr) {
        let Some(message_id) = message.message_id() else {
            return;
        };
        let ack = Message::new(MessageKind::Ack)
            .with(field::TO, sender)
            .with(field::MESSAGE_ID, message_id)
            .with(field::STATUS, "RECEIVED");
        self.send(&ack.to_bytes(), dest).await;
    }

    async fn on_register(&self, message: &Message, sender: &str, source: SocketAddr) {
        let display_name = message
            .get(field::DISPLAY_NAME)
            .unwrap_or_else(|| shared::short_name(sender))
            .to_string();
        let registered = self
            .directory
            .write()
            .await
            .register(sender, source, &display_name);
        let peers = match registered {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Refusing {}: {}", sender, e);
                return;
            }
        };

        let listed: HashMap<&str, &str> = peers
            .iter()
            .filter(|peer| peer.user_id != sender)
            .map(|peer| (peer.user_id.as_str(), peer.display_name.as_str()))
            .collect();
        let peer_json = match serde_json::to_string(&listed) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode peer list: {}", e);
                return;
            }
        };
        let welcome = Message::new(MessageKind::Welcome)
            .with(field::TO, sender)
            .with(field::PEERS, peer_json)
            .with(field::TIMESTAMP, unix_now().to_string());
        self.send(&welcome.to_bytes(), source).await;

        let joined = Message::new(MessageKind::PeerJoined)
            .with(field::USER_ID, sender)
            .with(field::DISPLAY_NAME, display_name);
        let others: Vec<SocketAddr> = peers
            .iter()
            .filter(|peer| peer.user_id != sender)
            .map(|peer| peer.addr)
            .collect();
        self.forward(&joined.to_bytes(), others).await;
    }

    async fn on_profile(&self, raw: &[u8], message: &Message, sender: &str, source: SocketAddr) {
        let observed = self.directory.write().await.observe_profile(
            sender,
            source,
            message.get(field::DISPLAY_NAME),
            message.get(field::STATUS),
            None,
        );
        if let Err(e) = observed {
            warn!("Profile of {} not recorded: {}", sender, e);
            return;
        }
        let others = self.others(sender).await;
        self.forward(raw, others).await;
    }

    async fn on_post(&self, raw: &[u8], sender: &str) {
        let addrs = self.directory.read().await.addrs();
        let recipients = self.social.read().await.post_recipients(sender, &addrs);
        debug!("Relaying post from {} to {} followers", sender, recipients.len());
        self.forward(raw, recipients.into_iter().map(|(_, addr)| addr))
            .await;
    }

    async fn on_follow(&self, message: &Message, sender: &str, source: SocketAddr) {
        let Some(target) = message.get(field::TO) else {
            return;
        };
        let (known, target_addr, display_name) = {
            let directory = self.directory.read().await;
            let display_name = directory
                .get(sender)
                .map(|record| record.display_name.clone())
                .unwrap_or_default();
            (directory.contains(target), directory.addr_of(target), display_name)
        };

        let result = self.social.write().await.follow(sender, target, known);
        match result {
            Ok(()) => {
                if let Some(addr) = target_addr {
                    let notify = Message::new(MessageKind::FollowNotify)
                        .with(field::USER_ID, sender)
                        .with(field::TO, target)
                        .with(field::DISPLAY_NAME, display_name)
                        .with(field::TIMESTAMP, unix_now().to_string());
                    self.send(&notify.to_bytes(), addr).await;
                }
                self.ack(message, sender, source).await;
            }
            Err(SocialError::AlreadyFollowing { .. }) => self.ack(message, sender, source).await,
            Err(e) => debug!("Follow from {} refused: {}", sender, e),
        }
    }

    async fn on_unfollow(&self, raw: &[u8], message: &Message, sender: &str, source: SocketAddr) {
        let Some(target) = message.get(field::TO) else {
            return;
        };
        if let Err(e) = self.social.write().await.unfollow(sender, target) {
            debug!("{}", e);
        }
        self.ack(message, sender, source).await;

        let target_addr = self.directory.read().await.addr_of(target);
        self.forward(raw, target_addr).await;
    }

    /// Member addresses, sender excluded
    async fn member_addrs(&self, members: &BTreeSet<String>, sender: &str) -> Vec<SocketAddr> {
        let directory = self.directory.read().await;
        members
            .iter()
            .filter(|member| member.as_str() != sender)
            .filter_map(|member| directory.addr_of(member))
            .collect()
    }

    async fn on_group_create(
        &self,
        raw: &[u8],
        message: &Message,
        sender: &str,
        source: SocketAddr,
    ) {
        let Some(group_id) = message.get(field::GROUP_ID) else {
            return;
        };
        let name = message.get(field::GROUP_NAME).unwrap_or(group_id);
        let members = split_list(message.get(field::MEMBERS).unwrap_or_default());

        let members = {
            let mut social = self.social.write().await;
            if let Err(e) = social.create_group(group_id, name, sender, members) {
                warn!("Group create from {} refused: {}", sender, e);
                return;
            }
            social
                .group(group_id)
                .map(|group| group.members.clone())
                .unwrap_or_default()
        };
        self.ack(message, sender, source).await;

        let dests = self.member_addrs(&members, sender).await;
        self.forward(raw, dests).await;
    }

    async fn on_group_update(
        &self,
        raw: &[u8],
        message: &Message,
        sender: &str,
        source: SocketAddr,
    ) {
        let Some(group_id) = message.get(field::GROUP_ID) else {
            return;
        };
        let add = split_list(message.get(field::ADD).unwrap_or_default());
        let remove = split_list(message.get(field::REMOVE).unwrap_or_default());

        let audience = {
            let mut social = self.social.write().await;
            let Some(group) = social.group(group_id) else {
                debug!("Update for unknown group {} from {}", group_id, sender);
                return;
            };
            if !group.is_member(sender) {
                debug!("{} is not a member of {}", sender, group_id);
                return;
            }
            // Removed members still hear about their removal
            let mut audience = group.members.clone();
            match social.update_group(group_id, &add, &remove, message.get(field::GROUP_NAME)) {
                Ok(group) => audience.extend(group.members.iter().cloned()),
                Err(e) => {
                    debug!("{}", e);
                    return;
                }
            }
            audience
        };
        self.ack(message, sender, source).await;

        let dests = self.member_addrs(&audience, sender).await;
        self.forward(raw, dests).await;
    }

    async fn on_group_message(
        &self,
        raw: &[u8],
        message: &Message,
        sender: &str,
        source: SocketAddr,
    ) {
        let Some(group_id) = message.get(field::GROUP_ID) else {
            return;
        };
        let addrs = self.directory.read().await.addrs();
        let recipients = self
            .social
            .read()
            .await
            .group_recipients(group_id, sender, &addrs);
        match recipients {
            Ok(recipients) => {
                self.ack(message, sender, source).await;
                self.forward(raw, recipients.into_iter().map(|(_, addr)| addr))
                    .await;
            }
            Err(e) => debug!("Group message from {} dropped: {}", sender, e),
        }
    }

    async fn on_revoke(&self, raw: &[u8], message: &Message, sender: &str) {
        let Some(token) = message.get(field::TOKEN) else {
            return;
        };
        match Token::decode(token) {
            Ok(decoded) if decoded.subject == sender => {}
            Ok(decoded) => {
                warn!("{} tried to revoke a token of {}", sender, decoded.subject);
                return;
            }
            Err(e) => {
                debug!("Revoke from {} ignored: {}", sender, e);
                return;
            }
        }
        if self.tokens.write().await.revoke(token) {
            info!("Token of {} revoked", sender);
            let others = self.others(sender).await;
            self.forward(raw, others).await;
        }
    }

    async fn route_to_recipient(
        &self,
        raw: &[u8],
        kind: MessageKind,
        message: &Message,
        sender: &str,
    ) {
        let Some(to) = message.get(field::TO) else {
            debug!("{} from {} has no recipient", kind, sender);
            return;
        };
        match self.directory.read().await.addr_of(to) {
            Some(addr) => self.send(raw, addr).await,
            None => debug!("{} from {} to unknown {}", kind, sender, to),
        }
    }
}
