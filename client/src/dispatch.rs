//! Inbound message handling
//!
//! Every datagram goes through the same gate: parse with identity binding,
//! drop echoes of our own broadcasts, drop messages addressed to someone else,
//! check the token for scoped kinds, then hand the message to its handler.
//! Reliable kinds are acknowledged once they pass the gate, even when the
//! handler decides the content is stale or invalid, so the sender stops
//! retransmitting. Game invites and moves the local session rejects are the
//! exception: they stay unacknowledged and the sender's delivery fails.

use crate::events::NodeEvent;
use crate::files::{ChunkOutcome, FileOffer, TransferStatus};
use crate::game::{GameError, Move, Symbol};
use crate::network::{Mode, NodeError, NodeInner};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use shared::message::split_list;
use shared::{
    field, Avatar, CodecError, Message, MessageKind, ProfileChange, SocialError, Token,
    MAX_AVATAR_BYTES,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

impl NodeInner {
    pub(crate) async fn handle_datagram(self: &Arc<Self>, raw: &[u8], source: SocketAddr) {
        let from_server = matches!(self.mode, Mode::Relay(server) if server == source);
        let parsed = if from_server {
            Message::parse(raw)
        } else {
            Message::parse_from(raw, source)
        };
        let message = match parsed {
            Ok(message) => message,
            Err(CodecError::Spoofed { .. }) => return,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", source, e);
                return;
            }
        };

        if message.identity() == Some(self.me.as_str()) {
            return;
        }
        let Some(kind) = message.kind() else {
            debug!("Unhandled message type {} from {}", message.type_tag(), source);
            return;
        };
        if let Some(to) = message.get(field::TO) {
            if to != self.me {
                debug!("{} from {} is addressed to {}", kind, source, to);
                return;
            }
        }
        if let Err(e) = self.authorize(kind, &message).await {
            debug!("Unauthorized {} from {}: {}", kind, source, e);
            return;
        }
        if let Some(sender) = message.identity() {
            self.directory.lock().await.touch(sender, source);
        }

        let result = match kind {
            MessageKind::Ping | MessageKind::Pong | MessageKind::Profile => {
                self.on_presence(kind, &message, source).await
            }
            MessageKind::Welcome => self.on_welcome(&message, source).await,
            MessageKind::PeerJoined => self.on_peer_joined(&message, source).await,
            MessageKind::Post => self.on_post(&message).await,
            MessageKind::Like => self.on_like(&message),
            MessageKind::Dm => self.on_dm(&message).await,
            MessageKind::Follow | MessageKind::FollowNotify => self.on_follow(&message).await,
            MessageKind::Unfollow => self.on_unfollow(&message).await,
            MessageKind::FileOffer => self.on_file_offer(&message).await,
            MessageKind::FileChunk => self.on_file_chunk(&message, source).await,
            MessageKind::FileReceived => self.on_file_received(&message).await,
            MessageKind::TictactoeInvite => self.on_game_invite(&message).await,
            MessageKind::TictactoeMove => self.on_game_move(&message).await,
            MessageKind::TictactoeResult => self.on_game_result(&message).await,
            MessageKind::GroupCreate => self.on_group_create(&message).await,
            MessageKind::GroupUpdate => self.on_group_update(&message).await,
            MessageKind::GroupMessage => self.on_group_message(&message).await,
            MessageKind::Ack => self.on_ack(&message).await,
            MessageKind::Revoke => self.on_revoke(&message).await,
            MessageKind::Register | MessageKind::Heartbeat => {
                debug!("Ignoring server-bound {} from {}", kind, source);
                Ok(())
            }
        };
        let rejected = match result {
            Ok(()) => false,
            Err(e) => {
                debug!("{} from {} not applied: {}", kind, source, e);
                withholds_ack(kind, &e)
            }
        };

        if kind.is_reliable() && !rejected {
            if let Some(message_id) = message.message_id() {
                self.send_ack(message_id, message.identity(), source).await;
            }
        }
    }

    async fn authorize(&self, kind: MessageKind, message: &Message) -> Result<(), NodeError> {
        let Some(scope) = kind.required_scope() else {
            return Ok(());
        };
        let token = message.require(field::TOKEN)?;
        let claimed = sender(message)?;
        self.tokens.lock().await.validate(token, scope, claimed)?;
        Ok(())
    }

    async fn send_ack(&self, message_id: &str, to: Option<&str>, dest: SocketAddr) {
        let mut ack = Message::new(MessageKind::Ack)
            .with(field::FROM, self.me.clone())
            .with(field::MESSAGE_ID, message_id)
            .with(field::STATUS, "RECEIVED");
        if let Some(to) = to {
            ack.set(field::TO, to);
        }
        self.send_raw(&ack, dest).await;
    }

    async fn on_presence(
        self: &Arc<Self>,
        kind: MessageKind,
        message: &Message,
        source: SocketAddr,
    ) -> Result<(), NodeError> {
        let user_id = sender(message)?;
        if kind == MessageKind::Ping && self.mode == Mode::Peer {
            self.pong(source).await;
        }
        let change = self.directory.lock().await.observe_profile(
            user_id,
            source,
            message.get(field::DISPLAY_NAME),
            message.get(field::STATUS),
            avatar(message),
        )?;

        match change {
            ProfileChange::New => {
                let display_name = message
                    .get(field::DISPLAY_NAME)
                    .unwrap_or_else(|| shared::short_name(user_id))
                    .to_string();
                self.emit(NodeEvent::PeerDiscovered {
                    user_id: user_id.to_string(),
                    display_name,
                });
                // Newcomers learn about us without waiting for the next broadcast
                if self.mode == Mode::Peer && kind == MessageKind::Profile {
                    self.announce_to(source).await;
                }
            }
            ProfileChange::Updated => {
                let record = self.directory.lock().await.get(user_id).cloned();
                if let Some(record) = record {
                    self.emit(NodeEvent::ProfileUpdated {
                        user_id: record.user_id,
                        display_name: record.display_name,
                        status: record.status,
                    });
                }
            }
            ProfileChange::Unchanged => {}
        }
        Ok(())
    }

    async fn on_welcome(&self, message: &Message, source: SocketAddr) -> Result<(), NodeError> {
        let peers: HashMap<String, String> =
            serde_json::from_str(message.get(field::PEERS).unwrap_or("{}"))?;

        let mut listed: Vec<(String, String)> = Vec::with_capacity(peers.len());
        {
            let mut directory = self.directory.lock().await;
            for (user_id, display_name) in peers {
                if user_id == self.me {
                    continue;
                }
                directory.observe_profile(
                    &user_id,
                    source,
                    Some(display_name.as_str()),
                    None,
                    None,
                )?;
                listed.push((user_id, display_name));
            }
        }
        listed.sort();
        info!("Registered with server, {} peers online", listed.len());
        self.emit(NodeEvent::Welcomed { peers: listed });
        Ok(())
    }

    async fn on_peer_joined(&self, message: &Message, source: SocketAddr) -> Result<(), NodeError> {
        let user_id = message.require(field::USER_ID)?;
        let display_name = message
            .get(field::DISPLAY_NAME)
            .unwrap_or_else(|| shared::short_name(user_id));
        let change = self.directory.lock().await.observe_profile(
            user_id,
            source,
            Some(display_name),
            None,
            None,
        )?;
        if change == ProfileChange::New {
            self.emit(NodeEvent::PeerDiscovered {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
            });
        }
        Ok(())
    }

    async fn on_post(&self, message: &Message) -> Result<(), NodeError> {
        let author = sender(message)?;
        if !self.social.lock().await.follows(&self.me, author) {
            debug!("Ignoring post from {} (not followed)", author);
            return Ok(());
        }
        let message_id = message.message_id().unwrap_or_default();
        if !message_id.is_empty() && !self.seen.lock().await.insert(message_id) {
            return Ok(());
        }

        let content = message
            .get(field::CONTENT)
            .or_else(|| message.get(field::MESSAGE))
            .unwrap_or_default();
        info!("Post from {}: {}", author, content);
        self.emit(NodeEvent::PostReceived {
            author: author.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    fn on_like(&self, message: &Message) -> Result<(), NodeError> {
        self.emit(NodeEvent::PostLiked {
            from: sender(message)?.to_string(),
            post_timestamp: message.get(field::POST_TIMESTAMP).unwrap_or_default().to_string(),
        });
        Ok(())
    }

    async fn on_dm(&self, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        message.require(field::TO)?;
        let message_id = message.message_id().unwrap_or_default();
        if !message_id.is_empty() && !self.seen.lock().await.insert(message_id) {
            debug!("Duplicate DM {} from {}", message_id, from);
            return Ok(());
        }

        let content = message.require(field::CONTENT)?;
        info!("DM from {}: {}", from, content);
        self.emit(NodeEvent::DirectMessage {
            from: from.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn on_follow(&self, message: &Message) -> Result<(), NodeError> {
        let follower = sender(message)?;
        match self.social.lock().await.follow(follower, &self.me, true) {
            Ok(()) => {}
            Err(SocialError::AlreadyFollowing { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!("{} followed you", follower);
        self.emit(NodeEvent::Followed {
            follower: follower.to_string(),
        });
        Ok(())
    }

    async fn on_unfollow(&self, message: &Message) -> Result<(), NodeError> {
        let follower = sender(message)?;
        match self.social.lock().await.unfollow(follower, &self.me) {
            Ok(()) => {}
            Err(SocialError::NotFollowing { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!("{} unfollowed you", follower);
        self.emit(NodeEvent::Unfollowed {
            follower: follower.to_string(),
        });
        Ok(())
    }

    async fn on_file_offer(self: &Arc<Self>, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        let offer = FileOffer::from_message(message)?;
        let file_id = offer.file_id.clone();
        if !self.files.lock().await.on_offer(from, offer.clone())? {
            return Ok(());
        }

        self.emit(NodeEvent::FileOffered {
            from: from.to_string(),
            offer,
        });
        if self.config.auto_accept_files {
            self.accept_file(&file_id).await?;
        }
        Ok(())
    }

    async fn on_file_chunk(&self, message: &Message, source: SocketAddr) -> Result<(), NodeError> {
        let from = sender(message)?;
        let file_id = message.require(field::FILEID)?;
        let index: u32 = message.require_parsed(field::CHUNK_INDEX)?;
        let total: u32 = message.require_parsed(field::TOTAL_CHUNKS)?;
        let data = BASE64.decode(message.require(field::DATA)?.trim())?;
        if message.get(field::CHUNK_SIZE).is_some() {
            let declared: usize = message.require_parsed(field::CHUNK_SIZE)?;
            if declared != data.len() {
                return Err(CodecError::InvalidField {
                    field: field::CHUNK_SIZE.to_string(),
                    value: declared.to_string(),
                }
                .into());
            }
        }

        let outcome = self
            .files
            .lock()
            .await
            .on_chunk(file_id, from, index, total, data);
        match outcome {
            ChunkOutcome::Completed(file) => self.finish_file(file, Some(source)).await,
            ChunkOutcome::AutoIgnored => {
                self.send_file_receipt(file_id, from, TransferStatus::Ignored, source)
                    .await;
                self.emit(NodeEvent::FileIgnored {
                    file_id: file_id.to_string(),
                });
            }
            ChunkOutcome::Stored { received, total } => {
                debug!("{}: {}/{} chunks", file_id, received, total);
            }
            other => debug!("Chunk {} of {}: {:?}", index, file_id, other),
        }
        Ok(())
    }

    async fn on_file_received(&self, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        let file_id = message.require(field::FILEID)?;
        let status = TransferStatus::parse(message.require(field::STATUS)?).ok_or_else(|| {
            CodecError::InvalidField {
                field: field::STATUS.to_string(),
                value: message.get(field::STATUS).unwrap_or_default().to_string(),
            }
        })?;

        if let Some(status) = self.files.lock().await.on_receipt(file_id, from, status) {
            self.emit(NodeEvent::FileDelivered {
                file_id: file_id.to_string(),
                status,
            });
        }
        Ok(())
    }

    async fn on_game_invite(&self, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        let game_id = message.require(field::GAMEID)?;
        let inviter_symbol: Symbol = message.require(field::SYMBOL)?.parse()?;
        let (player_x, player_o) = match (message.get(field::PLAYER_X), message.get(field::PLAYER_O)) {
            (Some(x), Some(o)) => (x.to_string(), o.to_string()),
            _ => match inviter_symbol {
                Symbol::X => (from.to_string(), self.me.clone()),
                Symbol::O => (self.me.clone(), from.to_string()),
            },
        };
        let inviter_holds = match inviter_symbol {
            Symbol::X => player_x == from,
            Symbol::O => player_o == from,
        };
        let invitee_holds = match inviter_symbol {
            Symbol::X => player_o == self.me,
            Symbol::O => player_x == self.me,
        };
        if !inviter_holds || !invitee_holds {
            return Err(GameError::NotParticipant(from.to_string()).into());
        }

        if self
            .games
            .lock()
            .await
            .accept_invite(game_id, &player_x, &player_o)
        {
            self.emit(NodeEvent::GameInvited {
                game_id: game_id.to_string(),
                from: from.to_string(),
                symbol: inviter_symbol.opponent(),
            });
        }
        Ok(())
    }

    async fn on_game_move(&self, message: &Message) -> Result<(), NodeError> {
        let player = sender(message)?;
        let game_id = message.require(field::GAMEID)?;
        let position: usize = if message.get(field::POSITION).is_some() {
            message.require_parsed(field::POSITION)?
        } else {
            message.require_parsed(field::POS)?
        };
        let turn: u32 = message.require_parsed(field::TURN)?;
        let symbol: Symbol = message.require(field::SYMBOL)?.parse()?;

        let applied = self
            .games
            .lock()
            .await
            .apply_move(game_id, player, symbol, position, turn);
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(GameError::AlreadyApplied(turn)) => {
                debug!("Repeated move {} in game {}", turn, game_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.emit(NodeEvent::GameMoved {
            game_id: game_id.to_string(),
            mv: Move {
                turn,
                position,
                symbol,
                player: player.to_string(),
            },
        });
        if let Some(outcome) = outcome {
            self.emit(NodeEvent::GameOver {
                game_id: game_id.to_string(),
                outcome,
            });
        }
        Ok(())
    }

    async fn on_game_result(&self, message: &Message) -> Result<(), NodeError> {
        let game_id = message.require(field::GAMEID)?;
        let reported = message.require(field::RESULT)?;
        let local = self
            .games
            .lock()
            .await
            .get(game_id)
            .and_then(|session| session.outcome());

        match local {
            Some(outcome) if outcome.result_tag().eq_ignore_ascii_case(reported) => {
                debug!("Game {} result {} confirmed", game_id, reported);
            }
            Some(outcome) => warn!(
                "Game {} result mismatch: peer says {}, local {:?}",
                game_id, reported, outcome
            ),
            None => warn!("Result {} for unfinished or unknown game {}", reported, game_id),
        }
        Ok(())
    }

    async fn on_group_create(&self, message: &Message) -> Result<(), NodeError> {
        let owner = sender(message)?;
        let group_id = message.require(field::GROUP_ID)?;
        let name = message.get(field::GROUP_NAME).unwrap_or(group_id);
        let members = split_list(message.get(field::MEMBERS).unwrap_or_default());

        let member_list = {
            let mut social = self.social.lock().await;
            social.create_group(group_id, name, owner, members)?;
            social.group(group_id).cloned()
        };
        if let Some(group) = member_list.filter(|group| group.is_member(&self.me)) {
            info!("Added to group {} by {}", group.name, owner);
            self.emit(NodeEvent::GroupJoined {
                group_id: group.group_id,
                name: group.name,
                members: group.members.into_iter().collect(),
            });
        }
        Ok(())
    }

    async fn on_group_update(&self, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        let group_id = message.require(field::GROUP_ID)?;
        let add = split_list(message.get(field::ADD).unwrap_or_default());
        let remove = split_list(message.get(field::REMOVE).unwrap_or_default());

        let members = {
            let mut social = self.social.lock().await;
            let group = social
                .group(group_id)
                .ok_or_else(|| SocialError::UnknownGroup(group_id.to_string()))?;
            if !group.is_member(from) {
                return Err(SocialError::NotMember {
                    group_id: group_id.to_string(),
                    member: from.to_string(),
                }
                .into());
            }
            let group =
                social.update_group(group_id, &add, &remove, message.get(field::GROUP_NAME))?;
            group.members.iter().cloned().collect::<Vec<_>>()
        };
        self.emit(NodeEvent::GroupUpdated {
            group_id: group_id.to_string(),
            members,
        });
        Ok(())
    }

    async fn on_group_message(&self, message: &Message) -> Result<(), NodeError> {
        let from = sender(message)?;
        let group_id = message.require(field::GROUP_ID)?;
        {
            let social = self.social.lock().await;
            let group = social
                .group(group_id)
                .ok_or_else(|| SocialError::UnknownGroup(group_id.to_string()))?;
            if !group.is_member(from) {
                return Err(SocialError::NotMember {
                    group_id: group_id.to_string(),
                    member: from.to_string(),
                }
                .into());
            }
        }
        let message_id = message.message_id().unwrap_or_default();
        if !message_id.is_empty() && !self.seen.lock().await.insert(message_id) {
            return Ok(());
        }

        self.emit(NodeEvent::GroupMessage {
            group_id: group_id.to_string(),
            from: from.to_string(),
            content: message.get(field::CONTENT).unwrap_or_default().to_string(),
        });
        Ok(())
    }

    async fn on_ack(&self, message: &Message) -> Result<(), NodeError> {
        let message_id = message
            .message_id()
            .ok_or_else(|| CodecError::MissingField(field::MESSAGE_ID.to_string()))?;
        self.reliable.acknowledge(message_id).await;
        Ok(())
    }

    async fn on_revoke(&self, message: &Message) -> Result<(), NodeError> {
        let raw = message.require(field::TOKEN)?;
        let token = Token::decode(raw)?;
        if let Some(claimed) = message.identity() {
            if claimed != token.subject {
                warn!("{} tried to revoke a token of {}", claimed, token.subject);
                return Ok(());
            }
        }
        if self.tokens.lock().await.revoke(raw) {
            self.emit(NodeEvent::TokenRevoked {
                token: raw.to_string(),
            });
        }
        Ok(())
    }
}

/// Rejected game invites and moves are not acknowledged
fn withholds_ack(kind: MessageKind, error: &NodeError) -> bool {
    matches!(kind, MessageKind::TictactoeInvite | MessageKind::TictactoeMove)
        && matches!(error, NodeError::Game(_))
}

/// Claimed sender identity, `FROM` or `USER_ID`
fn sender(message: &Message) -> Result<&str, CodecError> {
    message
        .identity()
        .ok_or_else(|| CodecError::MissingField(field::FROM.to_string()))
}

/// Avatar carried by a PROFILE, dropped when oversized
fn avatar(message: &Message) -> Option<Avatar> {
    let mime_type = message.get(field::AVATAR_TYPE)?;
    let data = message.get(field::AVATAR_DATA)?;
    // base64 inflates by 4/3
    if data.len() / 4 * 3 > MAX_AVATAR_BYTES {
        debug!("Dropping oversized avatar ({} encoded bytes)", data.len());
        return None;
    }
    Some(Avatar {
        mime_type: mime_type.to_string(),
        encoding: message
            .get(field::AVATAR_ENCODING)
            .unwrap_or("base64")
            .to_string(),
        data: data.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avatar_parsing() {
        let message = Message::new(MessageKind::Profile)
            .with(field::AVATAR_TYPE, "image/png")
            .with(field::AVATAR_DATA, "aGVsbG8=");
        let avatar = avatar(&message).unwrap();
        assert_eq!(avatar.mime_type, "image/png");
        assert_eq!(avatar.encoding, "base64");

        let huge = Message::new(MessageKind::Profile)
            .with(field::AVATAR_TYPE, "image/png")
            .with(field::AVATAR_DATA, "A".repeat(40_000));
        assert!(super::avatar(&huge).is_none());

        assert!(super::avatar(&Message::new(MessageKind::Profile)).is_none());
    }

    #[test]
    fn test_only_rejected_game_messages_withhold_ack() {
        let rejected = NodeError::Game(GameError::NotActive(crate::game::GameStatus::Invited));
        assert!(withholds_ack(MessageKind::TictactoeMove, &rejected));
        assert!(withholds_ack(MessageKind::TictactoeInvite, &rejected));
        assert!(!withholds_ack(MessageKind::Dm, &rejected));

        let malformed = NodeError::Codec(CodecError::MissingField(field::TURN.to_string()));
        assert!(!withholds_ack(MessageKind::TictactoeMove, &malformed));
    }

    #[test]
    fn test_sender_requires_identity() {
        let anonymous = Message::new(MessageKind::Dm);
        assert!(matches!(
            sender(&anonymous),
            Err(CodecError::MissingField(_))
        ));
        let named = Message::new(MessageKind::Dm).with(field::USER_ID, "bob@10.0.0.2");
        assert_eq!(sender(&named).unwrap(), "bob@10.0.0.2");
    }
}
