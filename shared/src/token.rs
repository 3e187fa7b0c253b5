//! Scope-bound bearer tokens
//!
//! Tokens are plain strings of the form `subject|expiry|scope` where expiry is
//! a Unix timestamp in seconds. A token authorizes exactly one scope for the
//! identity named in its subject until it expires or is revoked.

use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Broadcast,
    Chat,
    Follow,
    File,
    Game,
    Group,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Broadcast => "broadcast",
            Scope::Chat => "chat",
            Scope::Follow => "follow",
            Scope::File => "file",
            Scope::Game => "game",
            Scope::Group => "group",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(Scope::Broadcast),
            "chat" => Ok(Scope::Chat),
            "follow" => Ok(Scope::Follow),
            "file" => Ok(Scope::File),
            "game" => Ok(Scope::Game),
            "group" => Ok(Scope::Group),
            other => Err(TokenError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unknown scope {0:?}")]
    UnknownScope(String),
    #[error("token has been revoked")]
    Revoked,
    #[error("token expired at {expiry} (now {now})")]
    Expired { expiry: u64, now: u64 },
    #[error("token scope {actual} does not grant {expected}")]
    ScopeMismatch { expected: Scope, actual: Scope },
    #[error("token subject {actual} does not match sender {expected}")]
    SubjectMismatch { expected: String, actual: String },
}

/// Decoded form of a token string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub subject: String,
    pub expiry: u64,
    pub scope: Scope,
}

impl Token {
    pub fn new(subject: impl Into<String>, expiry: u64, scope: Scope) -> Self {
        Self {
            subject: subject.into(),
            expiry,
            scope,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.subject,
            self.expiry,
            self.scope,
            sep = SEPARATOR
        )
    }

    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = raw.trim().split(SEPARATOR).collect();
        let [subject, expiry, scope] = parts.as_slice() else {
            return Err(TokenError::Malformed);
        };
        if subject.is_empty() {
            return Err(TokenError::Malformed);
        }
        let expiry = expiry.parse().map_err(|_| TokenError::Malformed)?;
        Ok(Self {
            subject: subject.to_string(),
            expiry,
            scope: scope.parse()?,
        })
    }
}

/// Issues, validates and revokes tokens
///
/// Revocations are permanent for the life of the authority. Issued tokens are
/// only remembered for bookkeeping and can be purged once expired.
#[derive(Debug, Default)]
pub struct TokenAuthority {
    revoked: HashSet<String>,
    issued: HashMap<String, Token>,
}

impl TokenAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a token for `subject` valid for `ttl_secs` from now
    pub fn issue(&mut self, subject: &str, scope: Scope, ttl_secs: u64) -> String {
        self.issue_at(subject, scope, ttl_secs, crate::unix_now())
    }

    pub fn issue_at(&mut self, subject: &str, scope: Scope, ttl_secs: u64, now: u64) -> String {
        let token = Token::new(subject, now.saturating_add(ttl_secs), scope);
        let encoded = token.encode();
        self.issued.insert(encoded.clone(), token);
        encoded
    }

    pub fn validate(
        &self,
        raw: &str,
        required: Scope,
        claimed_subject: &str,
    ) -> Result<Token, TokenError> {
        self.validate_at(raw, required, claimed_subject, crate::unix_now())
    }

    /// Checks a token against every condition and reports the first failure
    pub fn validate_at(
        &self,
        raw: &str,
        required: Scope,
        claimed_subject: &str,
        now: u64,
    ) -> Result<Token, TokenError> {
        let token = Token::decode(raw)?;
        if self.revoked.contains(raw.trim()) {
            return Err(TokenError::Revoked);
        }
        if now > token.expiry {
            return Err(TokenError::Expired {
                expiry: token.expiry,
                now,
            });
        }
        if token.scope != required {
            return Err(TokenError::ScopeMismatch {
                expected: required,
                actual: token.scope,
            });
        }
        if token.subject != claimed_subject {
            return Err(TokenError::SubjectMismatch {
                expected: claimed_subject.to_string(),
                actual: token.subject,
            });
        }
        Ok(token)
    }

    pub fn is_valid(&self, raw: &str, required: Scope, claimed_subject: &str) -> bool {
        self.validate(raw, required, claimed_subject).is_ok()
    }

    /// Revokes a token; returns false if it was already revoked
    pub fn revoke(&mut self, raw: &str) -> bool {
        let raw = raw.trim();
        self.issued.remove(raw);
        let newly = self.revoked.insert(raw.to_string());
        if newly {
            debug!("Token revoked: {}", raw);
        }
        newly
    }

    pub fn is_revoked(&self, raw: &str) -> bool {
        self.revoked.contains(raw.trim())
    }

    /// Drops bookkeeping for issued tokens that have expired
    pub fn purge_issued(&mut self, now: u64) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, token| token.expiry >= now);
        before - self.issued.len()
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;
    const ALICE: &str = "alice@10.0.0.1";

    #[test]
    fn test_issue_format() {
        let mut authority = TokenAuthority::new();
        let token = authority.issue_at(ALICE, Scope::Chat, 3600, NOW);

        assert_eq!(token, format!("{}|{}|chat", ALICE, NOW + 3600));
        assert_eq!(authority.issued_count(), 1);
    }

    #[test]
    fn test_validate_accepts_fresh_token() {
        let mut authority = TokenAuthority::new();
        let token = authority.issue_at(ALICE, Scope::Broadcast, 3600, NOW);

        let decoded = authority
            .validate_at(&token, Scope::Broadcast, ALICE, NOW + 10)
            .unwrap();
        assert_eq!(decoded.subject, ALICE);
        assert_eq!(decoded.scope, Scope::Broadcast);
    }

    #[test]
    fn test_each_condition_flips_acceptance() {
        let authority = TokenAuthority::new();
        let valid = Token::new(ALICE, NOW + 60, Scope::File).encode();
        assert!(authority
            .validate_at(&valid, Scope::File, ALICE, NOW)
            .is_ok());

        let expired = Token::new(ALICE, NOW - 1, Scope::File).encode();
        assert!(matches!(
            authority.validate_at(&expired, Scope::File, ALICE, NOW),
            Err(TokenError::Expired { .. })
        ));

        assert!(matches!(
            authority.validate_at(&valid, Scope::Game, ALICE, NOW),
            Err(TokenError::ScopeMismatch { .. })
        ));

        assert!(matches!(
            authority.validate_at(&valid, Scope::File, "mallory@10.0.0.1", NOW),
            Err(TokenError::SubjectMismatch { .. })
        ));

        let mut revoking = TokenAuthority::new();
        assert!(revoking.revoke(&valid));
        assert_eq!(
            revoking.validate_at(&valid, Scope::File, ALICE, NOW),
            Err(TokenError::Revoked)
        );
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let authority = TokenAuthority::new();
        let token = Token::new(ALICE, NOW, Scope::Chat).encode();
        assert!(authority.validate_at(&token, Scope::Chat, ALICE, NOW).is_ok());
        assert!(authority
            .validate_at(&token, Scope::Chat, ALICE, NOW + 1)
            .is_err());
    }

    #[test]
    fn test_malformed_tokens() {
        let authority = TokenAuthority::new();
        for raw in [
            "",
            "alice|123",
            "alice|123|chat|extra",
            "alice|soon|chat",
            "|123|chat",
        ] {
            assert_eq!(
                authority.validate_at(raw, Scope::Chat, "alice", NOW),
                Err(TokenError::Malformed),
                "{:?}",
                raw
            );
        }
        assert_eq!(
            authority.validate_at("alice|123|admin", Scope::Chat, "alice", NOW),
            Err(TokenError::UnknownScope("admin".to_string()))
        );
    }

    #[test]
    fn test_revocation_is_permanent() {
        let mut authority = TokenAuthority::new();
        let token = authority.issue_at(ALICE, Scope::Group, 3600, NOW);

        assert!(authority.revoke(&token));
        assert!(!authority.revoke(&token));
        assert!(authority.is_revoked(&token));

        authority.purge_issued(NOW + 10_000);
        assert!(authority.is_revoked(&token));
    }

    #[test]
    fn test_purge_issued() {
        let mut authority = TokenAuthority::new();
        authority.issue_at(ALICE, Scope::Chat, 10, NOW);
        authority.issue_at(ALICE, Scope::Game, 1000, NOW);

        assert_eq!(authority.purge_issued(NOW + 100), 1);
        assert_eq!(authority.issued_count(), 1);
    }
}
