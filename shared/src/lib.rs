//! # LSNP Protocol Core
//!
//! Types and state shared by the rendezvous server and every LSNP node:
//!
//! - [`message`]: the `KEY: VALUE` text codec and source identity binding
//! - [`token`]: scope-bound bearer tokens with expiry and revocation
//! - [`directory`]: presence records with liveness eviction
//! - [`social`]: follow graph, group membership and fan-out selection
//!
//! Each registry is a plain owned struct; callers decide how to share it
//! (the server and node wrap each one in its own async lock).

pub mod directory;
pub mod message;
pub mod social;
pub mod token;

pub use directory::{Avatar, Directory, DirectoryError, PeerRecord, PeerSnapshot, ProfileChange};
pub use message::{build, field, CodecError, Message, MessageKind};
pub use social::{GroupRecord, SocialError, SocialRouter};
pub use token::{Scope, Token, TokenAuthority, TokenError};

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Well-known LSNP UDP port
pub const DEFAULT_PORT: u16 = 50999;
/// Receive buffer size; larger datagrams are truncated by the OS
pub const BUFFER_SIZE: usize = 65536;
/// Default payload bytes per FILE_CHUNK before base64 expansion
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Default lifetime of issued tokens in seconds
pub const DEFAULT_TOKEN_TTL: u64 = 3600;
/// TTL advertised on presence pings
pub const PING_TTL: u64 = 300;
/// Largest avatar payload accepted in a PROFILE, in bytes after decoding
pub const MAX_AVATAR_BYTES: usize = 20 * 1024;

/// Current Unix time in whole seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Random 16 hex character identifier used for messages, files, games and groups
pub fn new_message_id() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{:016x}", value)
}

/// Builds an `id@ip` identity string
pub fn identity(user: &str, ip: std::net::IpAddr) -> String {
    format!("{}@{}", user, ip)
}

/// Splits an identity into its user part and ip part
pub fn split_identity(identity: &str) -> Option<(&str, &str)> {
    identity.rsplit_once('@')
}

/// User part of an identity, or the whole string when it has no ip part
pub fn short_name(identity: &str) -> &str {
    split_identity(identity).map_or(identity, |(user, _)| user)
}
