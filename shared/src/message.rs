//! Text wire codec for LSNP datagrams
//!
//! A message is a block of `KEY: VALUE` lines terminated by a blank line:
//!
//! ```text
//! TYPE: DM
//! FROM: alice@192.168.1.7
//! TO: bob@192.168.1.9
//! CONTENT: hello
//!
//! ```
//!
//! Parsing is tolerant (CRLF, stray lines, missing terminator) while building
//! is strict, so that anything this node emits parses back to the same headers.
//! Identity binding ties the `id@ip` in `FROM`/`USER_ID` to the datagram source.

use crate::token::Scope;
use log::{debug, warn};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Header names used on the wire
pub mod field {
    pub const TYPE: &str = "TYPE";
    pub const FROM: &str = "FROM";
    pub const TO: &str = "TO";
    pub const USER_ID: &str = "USER_ID";
    pub const DISPLAY_NAME: &str = "DISPLAY_NAME";
    pub const STATUS: &str = "STATUS";
    pub const AVATAR_TYPE: &str = "AVATAR_TYPE";
    pub const AVATAR_ENCODING: &str = "AVATAR_ENCODING";
    pub const AVATAR_DATA: &str = "AVATAR_DATA";
    pub const PEERS: &str = "PEERS";
    pub const MESSAGE_ID: &str = "MESSAGE_ID";
    pub const MSGID: &str = "MSGID";
    pub const TOKEN: &str = "TOKEN";
    pub const TTL: &str = "TTL";
    pub const TIMESTAMP: &str = "TIMESTAMP";
    pub const CONTENT: &str = "CONTENT";
    pub const MESSAGE: &str = "MESSAGE";
    pub const POST_TIMESTAMP: &str = "POST_TIMESTAMP";
    pub const FILEID: &str = "FILEID";
    pub const FILENAME: &str = "FILENAME";
    pub const FILESIZE: &str = "FILESIZE";
    pub const FILETYPE: &str = "FILETYPE";
    pub const DESCRIPTION: &str = "DESCRIPTION";
    pub const TOTAL_CHUNKS: &str = "TOTAL_CHUNKS";
    pub const CHUNK_INDEX: &str = "CHUNK_INDEX";
    pub const CHUNK_SIZE: &str = "CHUNK_SIZE";
    pub const DATA: &str = "DATA";
    pub const GAMEID: &str = "GAMEID";
    pub const PLAYER_X: &str = "PLAYER_X";
    pub const PLAYER_O: &str = "PLAYER_O";
    pub const SYMBOL: &str = "SYMBOL";
    pub const POSITION: &str = "POSITION";
    pub const POS: &str = "POS";
    pub const TURN: &str = "TURN";
    pub const RESULT: &str = "RESULT";
    pub const WINNING_LINE: &str = "WINNING_LINE";
    pub const GROUP_ID: &str = "GROUP_ID";
    pub const GROUP_NAME: &str = "GROUP_NAME";
    pub const MEMBERS: &str = "MEMBERS";
    pub const ADD: &str = "ADD";
    pub const REMOVE: &str = "REMOVE";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("datagram contains no headers")]
    Empty,
    #[error("message has no TYPE header")]
    MissingType,
    #[error("duplicate header {0}")]
    DuplicateHeader(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("missing required field {0}")]
    MissingField(String),
    #[error("invalid value {value:?} for field {field}")]
    InvalidField { field: String, value: String },
    #[error("identity {claimed} does not match source {actual}")]
    Spoofed { claimed: String, actual: IpAddr },
    #[error("identity {0} has no valid ip part")]
    InvalidIdentity(String),
}

/// Every message type understood by LSNP nodes and the rendezvous server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Welcome,
    PeerJoined,
    Heartbeat,
    Profile,
    Ping,
    Pong,
    Post,
    Like,
    Dm,
    Follow,
    Unfollow,
    FollowNotify,
    FileOffer,
    FileChunk,
    FileReceived,
    TictactoeInvite,
    TictactoeMove,
    TictactoeResult,
    GroupCreate,
    GroupUpdate,
    GroupMessage,
    Ack,
    Revoke,
}

impl MessageKind {
    pub const ALL: [MessageKind; 24] = [
        MessageKind::Register,
        MessageKind::Welcome,
        MessageKind::PeerJoined,
        MessageKind::Heartbeat,
        MessageKind::Profile,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Post,
        MessageKind::Like,
        MessageKind::Dm,
        MessageKind::Follow,
        MessageKind::Unfollow,
        MessageKind::FollowNotify,
        MessageKind::FileOffer,
        MessageKind::FileChunk,
        MessageKind::FileReceived,
        MessageKind::TictactoeInvite,
        MessageKind::TictactoeMove,
        MessageKind::TictactoeResult,
        MessageKind::GroupCreate,
        MessageKind::GroupUpdate,
        MessageKind::GroupMessage,
        MessageKind::Ack,
        MessageKind::Revoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "REGISTER",
            MessageKind::Welcome => "WELCOME",
            MessageKind::PeerJoined => "PEER_JOINED",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Profile => "PROFILE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Post => "POST",
            MessageKind::Like => "LIKE",
            MessageKind::Dm => "DM",
            MessageKind::Follow => "FOLLOW",
            MessageKind::Unfollow => "UNFOLLOW",
            MessageKind::FollowNotify => "FOLLOW_NOTIFY",
            MessageKind::FileOffer => "FILE_OFFER",
            MessageKind::FileChunk => "FILE_CHUNK",
            MessageKind::FileReceived => "FILE_RECEIVED",
            MessageKind::TictactoeInvite => "TICTACTOE_INVITE",
            MessageKind::TictactoeMove => "TICTACTOE_MOVE",
            MessageKind::TictactoeResult => "TICTACTOE_RESULT",
            MessageKind::GroupCreate => "GROUP_CREATE",
            MessageKind::GroupUpdate => "GROUP_UPDATE",
            MessageKind::GroupMessage => "GROUP_MESSAGE",
            MessageKind::Ack => "ACK",
            MessageKind::Revoke => "REVOKE",
        }
    }

    /// Token scope a message of this kind must carry, if any
    pub fn required_scope(&self) -> Option<Scope> {
        match self {
            MessageKind::Post | MessageKind::Like => Some(Scope::Broadcast),
            MessageKind::Dm => Some(Scope::Chat),
            MessageKind::Follow | MessageKind::Unfollow => Some(Scope::Follow),
            MessageKind::FileOffer | MessageKind::FileChunk => Some(Scope::File),
            MessageKind::TictactoeInvite
            | MessageKind::TictactoeMove
            | MessageKind::TictactoeResult => Some(Scope::Game),
            MessageKind::GroupCreate | MessageKind::GroupUpdate | MessageKind::GroupMessage => {
                Some(Scope::Group)
            }
            MessageKind::Register
            | MessageKind::Welcome
            | MessageKind::PeerJoined
            | MessageKind::Heartbeat
            | MessageKind::Profile
            | MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::FollowNotify
            | MessageKind::FileReceived
            | MessageKind::Ack
            | MessageKind::Revoke => None,
        }
    }

    /// Whether senders retransmit this kind until an ACK arrives
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            MessageKind::Dm
                | MessageKind::Follow
                | MessageKind::Unfollow
                | MessageKind::FileOffer
                | MessageKind::FileChunk
                | MessageKind::TictactoeInvite
                | MessageKind::TictactoeMove
                | MessageKind::TictactoeResult
                | MessageKind::GroupCreate
                | MessageKind::GroupUpdate
                | MessageKind::GroupMessage
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CodecError::InvalidField {
                field: field::TYPE.to_string(),
                value: s.to_string(),
            })
    }
}

/// An ordered set of headers with a mandatory `TYPE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<(String, String)>,
}

impl Message {
    /// Starts a message of the given kind with `TYPE` as its first header
    pub fn new(kind: MessageKind) -> Self {
        Self {
            headers: vec![(field::TYPE.to_string(), kind.as_str().to_string())],
        }
    }

    /// Validates a header list and wraps it as a message
    pub fn from_headers(headers: Vec<(String, String)>) -> Result<Self, CodecError> {
        for (index, (key, value)) in headers.iter().enumerate() {
            validate_key(key)?;
            if value.contains(['\n', '\r']) {
                return Err(CodecError::InvalidHeader(key.clone()));
            }
            if headers[..index].iter().any(|(earlier, _)| earlier == key) {
                return Err(CodecError::DuplicateHeader(key.clone()));
            }
        }
        if !headers.iter().any(|(key, _)| key == field::TYPE) {
            return Err(CodecError::MissingType);
        }
        Ok(Self { headers })
    }

    /// Builder form of [`Message::set`]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a header, replacing an existing value in place
    ///
    /// Newlines in the value are folded to spaces so the message always builds.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value: String = value.into();
        let value = if value.contains(['\n', '\r']) {
            value.replace(['\n', '\r'], " ")
        } else {
            value
        };
        match self.headers.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str, CodecError> {
        self.get(key)
            .ok_or_else(|| CodecError::MissingField(key.to_string()))
    }

    /// Reads and parses a required field
    pub fn require_parsed<T: FromStr>(&self, key: &str) -> Result<T, CodecError> {
        let value = self.require(key)?;
        value.trim().parse().map_err(|_| CodecError::InvalidField {
            field: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn type_tag(&self) -> &str {
        self.get(field::TYPE).unwrap_or_default()
    }

    /// Known kind of this message, `None` for types this build does not handle
    pub fn kind(&self) -> Option<MessageKind> {
        self.type_tag().parse().ok()
    }

    /// Claimed sender identity, `FROM` taking precedence over `USER_ID`
    pub fn identity(&self) -> Option<&str> {
        self.get(field::FROM).or_else(|| self.get(field::USER_ID))
    }

    /// Correlation id, accepting the `MSGID` alias
    pub fn message_id(&self) -> Option<&str> {
        self.get(field::MESSAGE_ID).or_else(|| self.get(field::MSGID))
    }

    /// Checks the claimed `id@ip` identity against the datagram source
    ///
    /// Messages without an identity, or whose identity has no `@`, pass.
    pub fn verify_origin(&self, source: IpAddr) -> Result<(), CodecError> {
        let Some(claimed) = self.identity() else {
            return Ok(());
        };
        let Some((_, ip_part)) = crate::split_identity(claimed) else {
            return Ok(());
        };
        let claimed_ip: IpAddr = ip_part
            .trim()
            .parse()
            .map_err(|_| CodecError::InvalidIdentity(claimed.to_string()))?;
        if claimed_ip.to_canonical() != source.to_canonical() {
            return Err(CodecError::Spoofed {
                claimed: claimed.to_string(),
                actual: source,
            });
        }
        Ok(())
    }

    /// Parses a datagram without identity binding
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
        let mut headers: Vec<(String, String)> = Vec::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                if headers.is_empty() {
                    continue;
                }
                break;
            }

            let Some((key, value)) = line.split_once(':') else {
                debug!("Skipping header line without separator: {:?}", line);
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.strip_prefix(' ').unwrap_or(value);

            if headers.iter().any(|(k, _)| k == key) {
                debug!("Ignoring repeated header {}", key);
                continue;
            }
            headers.push((key.to_string(), value.to_string()));
        }

        if headers.is_empty() {
            return Err(CodecError::Empty);
        }
        if !headers.iter().any(|(k, _)| k == field::TYPE) {
            return Err(CodecError::MissingType);
        }
        Ok(Self { headers })
    }

    /// Parses a datagram and binds its claimed identity to the source address
    pub fn parse_from(raw: &[u8], source: SocketAddr) -> Result<Self, CodecError> {
        let message = Self::parse(raw)?;
        if let Err(e) = message.verify_origin(source.ip()) {
            warn!(
                "[SECURITY] Dropping {} from {}: {}",
                message.type_tag(),
                source,
                e
            );
            return Err(e);
        }
        Ok(message)
    }

    /// Renders the message as wire text including the blank-line terminator
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.headers.len() * 24 + 1);
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().into_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

fn validate_key(key: &str) -> Result<(), CodecError> {
    if key.is_empty()
        || key.trim() != key
        || key.contains(':')
        || key.contains(['\n', '\r'])
    {
        return Err(CodecError::InvalidHeader(key.to_string()));
    }
    Ok(())
}

/// Builds wire bytes from an ordered header list
pub fn build(headers: &[(&str, &str)]) -> Result<Vec<u8>, CodecError> {
    let owned = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(Message::from_headers(owned)?.to_bytes())
}

/// Splits a comma separated header value, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_basic_message() {
        let raw = b"TYPE: DM\nFROM: alice@10.0.0.1\nCONTENT: hi there\n\n";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.kind(), Some(MessageKind::Dm));
        assert_eq!(message.get(field::FROM), Some("alice@10.0.0.1"));
        assert_eq!(message.get(field::CONTENT), Some("hi there"));
        assert_eq!(message.headers().len(), 3);
    }

    #[test]
    fn test_parse_crlf_and_missing_terminator() {
        let raw = b"\r\nTYPE: PING\r\nUSER_ID: bob@10.0.0.2";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.kind(), Some(MessageKind::Ping));
        assert_eq!(message.get(field::USER_ID), Some("bob@10.0.0.2"));
    }

    #[test]
    fn test_parse_skips_lines_without_separator() {
        let raw = b"TYPE: POST\ngarbage line\nCONTENT: a: b\n\nTRAILING: ignored\n";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.headers().len(), 2);
        assert_eq!(message.get(field::CONTENT), Some("a: b"));
        assert_eq!(message.get("TRAILING"), None);
    }

    #[test]
    fn test_parse_keeps_first_duplicate() {
        let raw = b"TYPE: DM\nCONTENT: first\nCONTENT: second\n\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(message.get(field::CONTENT), Some("first"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Message::parse(&[0xff, 0xfe, 0x00]), Err(CodecError::NotUtf8));
        assert_eq!(Message::parse(b"\n\n"), Err(CodecError::Empty));
        assert_eq!(
            Message::parse(b"FROM: alice@10.0.0.1\n\n"),
            Err(CodecError::MissingType)
        );
    }

    #[test]
    fn test_unknown_type_parses_without_kind() {
        let message = Message::parse(b"TYPE: TELEPORT\n\n").unwrap();
        assert_eq!(message.type_tag(), "TELEPORT");
        assert_eq!(message.kind(), None);
    }

    #[test]
    fn test_build_then_parse_preserves_headers() {
        let headers = [
            ("TYPE", "GROUP_MESSAGE"),
            ("FROM", "carol@10.0.0.3"),
            ("CONTENT", "  spaced: value "),
            ("EMPTY", ""),
        ];
        let bytes = build(&headers).unwrap();
        let message = Message::parse(&bytes).unwrap();

        let parsed: Vec<(&str, &str)> = message
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(parsed, headers);
    }

    #[test]
    fn test_build_rejects_invalid_headers() {
        assert_eq!(
            build(&[("TYPE", "DM"), ("TYPE", "POST")]),
            Err(CodecError::DuplicateHeader("TYPE".to_string()))
        );
        assert!(build(&[("TYPE", "DM"), ("CONTENT", "two\nlines")]).is_err());
        assert!(build(&[("TYPE", "DM"), ("BAD:KEY", "x")]).is_err());
        assert!(build(&[("TYPE", "DM"), (" PADDED", "x")]).is_err());
        assert_eq!(build(&[("FROM", "x")]), Err(CodecError::MissingType));
    }

    #[test]
    fn test_set_replaces_and_folds_newlines() {
        let mut message = Message::new(MessageKind::Dm).with(field::CONTENT, "one");
        message.set(field::CONTENT, "two\nlines");

        assert_eq!(message.get(field::CONTENT), Some("two lines"));
        assert_eq!(message.headers().len(), 2);
        assert_eq!(Message::parse(&message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn test_require_parsed() {
        let message = Message::new(MessageKind::FileChunk)
            .with(field::CHUNK_INDEX, "3")
            .with(field::TOTAL_CHUNKS, "many");

        assert_eq!(message.require_parsed::<u32>(field::CHUNK_INDEX), Ok(3));
        assert!(matches!(
            message.require_parsed::<u32>(field::TOTAL_CHUNKS),
            Err(CodecError::InvalidField { .. })
        ));
        assert_eq!(
            message.require(field::FILEID),
            Err(CodecError::MissingField("FILEID".to_string()))
        );
    }

    #[test]
    fn test_identity_binding_accepts_matching_source() {
        let raw = Message::new(MessageKind::Post)
            .with(field::FROM, "alice@10.0.0.1")
            .to_bytes();
        assert!(Message::parse_from(&raw, addr("10.0.0.1:50999")).is_ok());
    }

    #[test]
    fn test_identity_binding_rejects_spoofed_source_for_every_kind() {
        for kind in MessageKind::ALL {
            let raw = Message::new(kind)
                .with(field::FROM, "alice@10.0.0.1")
                .to_bytes();
            let result = Message::parse_from(&raw, addr("10.0.0.99:50999"));
            assert!(
                matches!(result, Err(CodecError::Spoofed { .. })),
                "{} accepted from spoofed source",
                kind
            );
        }
    }

    #[test]
    fn test_identity_binding_prefers_from_over_user_id() {
        let raw = Message::new(MessageKind::Profile)
            .with(field::USER_ID, "alice@10.0.0.1")
            .with(field::FROM, "alice@10.0.0.2")
            .to_bytes();
        assert!(Message::parse_from(&raw, addr("10.0.0.2:1")).is_ok());
        assert!(Message::parse_from(&raw, addr("10.0.0.1:1")).is_err());
    }

    #[test]
    fn test_identity_binding_edge_cases() {
        let bare = Message::new(MessageKind::Ping)
            .with(field::USER_ID, "alice")
            .to_bytes();
        assert!(Message::parse_from(&bare, addr("10.0.0.5:1")).is_ok());

        let bad_ip = Message::new(MessageKind::Ping)
            .with(field::USER_ID, "alice@not-an-ip")
            .to_bytes();
        assert!(matches!(
            Message::parse_from(&bad_ip, addr("10.0.0.5:1")),
            Err(CodecError::InvalidIdentity(_))
        ));

        let anonymous = Message::new(MessageKind::Ack)
            .with(field::MESSAGE_ID, "abc")
            .to_bytes();
        assert!(Message::parse_from(&anonymous, addr("10.0.0.5:1")).is_ok());
    }

    #[test]
    fn test_message_id_alias() {
        let message = Message::new(MessageKind::Ack).with(field::MSGID, "deadbeef");
        assert_eq!(message.message_id(), Some("deadbeef"));
    }

    #[test]
    fn test_kind_metadata() {
        assert_eq!(MessageKind::Dm.required_scope(), Some(Scope::Chat));
        assert_eq!(MessageKind::Like.required_scope(), Some(Scope::Broadcast));
        assert_eq!(MessageKind::Revoke.required_scope(), None);
        assert!(MessageKind::FileChunk.is_reliable());
        assert!(!MessageKind::Post.is_reliable());
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" a@1.1.1.1, ,b@2.2.2.2,"),
            vec!["a@1.1.1.1".to_string(), "b@2.2.2.2".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
