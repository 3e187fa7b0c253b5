//! Follow graph and group membership
//!
//! The router keeps both directions of every follow edge so that fan-out
//! ("who follows the author?") and profile views ("who do I follow?") are
//! single lookups. Presence eviction never touches these sets; a peer that
//! reappears keeps its followers.

use log::{debug, info};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocialError {
    #[error("{follower} already follows {target}")]
    AlreadyFollowing { follower: String, target: String },
    #[error("{follower} does not follow {target}")]
    NotFollowing { follower: String, target: String },
    #[error("cannot follow yourself")]
    SelfFollow,
    #[error("unknown peer {0}")]
    UnknownTarget(String),
    #[error("unknown group {0}")]
    UnknownGroup(String),
    #[error("{member} is not a member of group {group_id}")]
    NotMember { group_id: String, member: String },
    #[error("group {group_id} belongs to {owner}")]
    GroupOwned { group_id: String, owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group_id: String,
    pub name: String,
    pub owner: String,
    pub members: BTreeSet<String>,
}

impl GroupRecord {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn member_list(&self) -> String {
        self.members.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Default)]
pub struct SocialRouter {
    /// follower -> followees
    following: HashMap<String, HashSet<String>>,
    /// followee -> followers
    followers: HashMap<String, HashSet<String>>,
    groups: HashMap<String, GroupRecord>,
}

impl SocialRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `requester -> target`; the caller notifies the target on success
    pub fn follow(
        &mut self,
        requester: &str,
        target: &str,
        target_known: bool,
    ) -> Result<(), SocialError> {
        if requester == target {
            return Err(SocialError::SelfFollow);
        }
        if self.follows(requester, target) {
            return Err(SocialError::AlreadyFollowing {
                follower: requester.to_string(),
                target: target.to_string(),
            });
        }
        if !target_known {
            return Err(SocialError::UnknownTarget(target.to_string()));
        }

        self.following
            .entry(requester.to_string())
            .or_default()
            .insert(target.to_string());
        self.followers
            .entry(target.to_string())
            .or_default()
            .insert(requester.to_string());
        info!("{} now follows {}", requester, target);
        Ok(())
    }

    pub fn unfollow(&mut self, requester: &str, target: &str) -> Result<(), SocialError> {
        let removed = self
            .following
            .get_mut(requester)
            .map_or(false, |set| set.remove(target));
        if !removed {
            return Err(SocialError::NotFollowing {
                follower: requester.to_string(),
                target: target.to_string(),
            });
        }
        if let Some(set) = self.followers.get_mut(target) {
            set.remove(requester);
        }
        info!("{} unfollowed {}", requester, target);
        Ok(())
    }

    pub fn follows(&self, follower: &str, target: &str) -> bool {
        self.following
            .get(follower)
            .map_or(false, |set| set.contains(target))
    }

    pub fn following_of(&self, user_id: &str) -> Vec<String> {
        sorted(self.following.get(user_id))
    }

    pub fn followers_of(&self, user_id: &str) -> Vec<String> {
        sorted(self.followers.get(user_id))
    }

    /// Addressable peers whose follow set contains the author
    pub fn post_recipients(
        &self,
        author: &str,
        addressable: &HashMap<String, SocketAddr>,
    ) -> Vec<(String, SocketAddr)> {
        let Some(followers) = self.followers.get(author) else {
            return Vec::new();
        };
        let mut recipients: Vec<(String, SocketAddr)> = followers
            .iter()
            .filter(|follower| follower.as_str() != author)
            .filter_map(|follower| {
                addressable
                    .get(follower)
                    .map(|addr| (follower.clone(), *addr))
            })
            .collect();
        recipients.sort();
        recipients
    }

    /// Hook for presence eviction; relationships survive
    pub fn on_peer_evicted(&self, user_id: &str) {
        debug!(
            "Peer {} evicted, keeping {} follow edges",
            user_id,
            self.followers_of(user_id).len() + self.following_of(user_id).len()
        );
    }

    /// Creates a group; only its owner may create the same id again
    ///
    /// The owner is always a member. Returns true when the id was new.
    pub fn create_group(
        &mut self,
        group_id: &str,
        name: &str,
        owner: &str,
        members: impl IntoIterator<Item = String>,
    ) -> Result<bool, SocialError> {
        if let Some(existing) = self.groups.get(group_id) {
            if existing.owner != owner {
                return Err(SocialError::GroupOwned {
                    group_id: group_id.to_string(),
                    owner: existing.owner.clone(),
                });
            }
        }

        let mut members: BTreeSet<String> = members.into_iter().collect();
        members.insert(owner.to_string());

        let record = GroupRecord {
            group_id: group_id.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            members,
        };
        let created = self.groups.insert(group_id.to_string(), record).is_none();
        if created {
            info!("Group {} ({}) created by {}", name, group_id, owner);
        }
        Ok(created)
    }

    pub fn update_group(
        &mut self,
        group_id: &str,
        add: &[String],
        remove: &[String],
        name: Option<&str>,
    ) -> Result<&GroupRecord, SocialError> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| SocialError::UnknownGroup(group_id.to_string()))?;

        for member in add {
            group.members.insert(member.clone());
        }
        for member in remove {
            group.members.remove(member);
        }
        if let Some(name) = name {
            group.name = name.to_string();
        }
        info!(
            "Group {} updated: +{} -{} ({} members)",
            group_id,
            add.len(),
            remove.len(),
            group.members.len()
        );
        Ok(group)
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupRecord> {
        self.groups.get(group_id)
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        let mut groups: Vec<GroupRecord> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }

    /// Members other than the sender that currently have an address
    ///
    /// Fails if the group is unknown or the sender is not a member.
    pub fn group_recipients(
        &self,
        group_id: &str,
        sender: &str,
        addressable: &HashMap<String, SocketAddr>,
    ) -> Result<Vec<(String, SocketAddr)>, SocialError> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| SocialError::UnknownGroup(group_id.to_string()))?;
        if !group.is_member(sender) {
            return Err(SocialError::NotMember {
                group_id: group_id.to_string(),
                member: sender.to_string(),
            });
        }

        Ok(group
            .members
            .iter()
            .filter(|member| member.as_str() != sender)
            .filter_map(|member| match addressable.get(member) {
                Some(addr) => Some((member.clone(), *addr)),
                None => {
                    debug!("Skipping unaddressable group member {}", member);
                    None
                }
            })
            .collect())
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut out: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    out.sort();
    out
}
