//! Presence directory: who is out there and where to reach them
//!
//! Records are keyed by full identity (`id@ip`). Every datagram observed from a
//! peer refreshes its address and last-seen instant; peers silent for longer
//! than the liveness timeout are evicted by [`Directory::sweep`].

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory is full ({0} peers)")]
    Full(usize),
}

/// Profile picture as carried in PROFILE headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub mime_type: String,
    pub encoding: String,
    pub data: String,
}

/// A known peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub user_id: String,
    pub addr: SocketAddr,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn new(user_id: &str, addr: SocketAddr, display_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            addr,
            display_name: display_name.to_string(),
            status: String::new(),
            avatar: None,
            last_seen: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            status: self.status.clone(),
            addr: self.addr,
        }
    }
}

/// Detached copy of a peer record, safe to hand out after the lock is released
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub status: String,
    pub addr: SocketAddr,
}

/// Outcome of observing a PROFILE/PING from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileChange {
    New,
    Updated,
    Unchanged,
}

pub struct Directory {
    peers: HashMap<String, PeerRecord>,
    liveness_timeout: Duration,
    max_peers: usize,
}

impl Directory {
    pub fn new(liveness_timeout: Duration, max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            liveness_timeout,
            max_peers,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Creates or overwrites a registration and returns the full peer set
    pub fn register(
        &mut self,
        user_id: &str,
        addr: SocketAddr,
        display_name: &str,
    ) -> Result<Vec<PeerSnapshot>, DirectoryError> {
        if !self.peers.contains_key(user_id) && self.peers.len() >= self.max_peers {
            return Err(DirectoryError::Full(self.max_peers));
        }

        let record = PeerRecord::new(user_id, addr, display_name);
        if self.peers.insert(user_id.to_string(), record).is_none() {
            info!("Peer {} registered from {}", user_id, addr);
        } else {
            debug!("Peer {} re-registered from {}", user_id, addr);
        }
        Ok(self.snapshot())
    }

    /// Refreshes liveness and address; returns false for unknown peers
    pub fn touch(&mut self, user_id: &str, addr: SocketAddr) -> bool {
        match self.peers.get_mut(user_id) {
            Some(record) => {
                record.last_seen = Instant::now();
                record.addr = addr;
                true
            }
            None => false,
        }
    }

    /// Records what a peer announced about itself
    ///
    /// Absent fields leave the stored value alone. Only actual changes are logged.
    pub fn observe_profile(
        &mut self,
        user_id: &str,
        addr: SocketAddr,
        display_name: Option<&str>,
        status: Option<&str>,
        avatar: Option<Avatar>,
    ) -> Result<ProfileChange, DirectoryError> {
        if let Some(record) = self.peers.get_mut(user_id) {
            record.last_seen = Instant::now();
            record.addr = addr;

            let mut changed = false;
            if let Some(name) = display_name {
                if record.display_name != name {
                    record.display_name = name.to_string();
                    changed = true;
                }
            }
            if let Some(status) = status {
                if record.status != status {
                    record.status = status.to_string();
                    changed = true;
                }
            }
            if avatar.is_some() && record.avatar != avatar {
                record.avatar = avatar;
                changed = true;
            }

            if changed {
                info!(
                    "Profile updated: {} ({}) {}",
                    record.display_name, user_id, record.status
                );
                return Ok(ProfileChange::Updated);
            }
            return Ok(ProfileChange::Unchanged);
        }

        if self.peers.len() >= self.max_peers {
            return Err(DirectoryError::Full(self.max_peers));
        }

        let name = display_name.unwrap_or_else(|| crate::short_name(user_id));
        let mut record = PeerRecord::new(user_id, addr, name);
        record.status = status.unwrap_or_default().to_string();
        record.avatar = avatar;
        info!("Discovered peer {} ({}) at {}", record.display_name, user_id, addr);
        self.peers.insert(user_id.to_string(), record);
        Ok(ProfileChange::New)
    }

    /// Evicts peers silent for longer than the liveness timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.liveness_timeout;
        let evicted: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, record)| record.is_timed_out(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for user_id in &evicted {
            self.peers.remove(user_id);
            info!("Peer {} timed out", user_id);
        }
        evicted
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PeerRecord> {
        self.peers.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&PeerRecord> {
        self.peers.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn addr_of(&self, user_id: &str) -> Option<SocketAddr> {
        self.peers.get(user_id).map(|record| record.addr)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&str> {
        self.peers
            .values()
            .find(|record| record.addr == addr)
            .map(|record| record.user_id.as_str())
    }

    /// Resolves a display name or short user name, case-insensitively
    pub fn find_by_name(&self, name: &str) -> Option<&str> {
        self.peers
            .values()
            .find(|record| {
                record.display_name.eq_ignore_ascii_case(name)
                    || crate::short_name(&record.user_id).eq_ignore_ascii_case(name)
            })
            .map(|record| record.user_id.as_str())
    }

    /// All addressable peers as `(id, address)` pairs
    pub fn addrs(&self) -> HashMap<String, SocketAddr> {
        self.peers
            .iter()
            .map(|(id, record)| (id.clone(), record.addr))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.peers.values().map(PeerRecord::snapshot).collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
