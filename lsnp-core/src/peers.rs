//! Peer directory: identities → observed network address and last profile.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::identity::{username_of, Avatar, UserId};

/// What we know about a remote peer, refreshed by every PROFILE it sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
    /// Source address of the datagram that carried the last PROFILE.
    pub addr: SocketAddr,
    /// Host tick at which the record was last refreshed.
    pub last_seen: u64,
}

/// Profile fields as announced by the peer.
#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
}

/// Outcome of [`PeerDirectory::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Refreshed,
    /// The profile claims our own username; it is our broadcast looping back.
    SelfSuppressed,
}

pub struct PeerDirectory {
    local: UserId,
    peers: HashMap<UserId, PeerRecord>,
}

impl PeerDirectory {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    /// Insert or overwrite the record for `identity`. The address is the one observed
    /// by the transport, not the one claimed inside the identity.
    pub fn upsert(
        &mut self,
        identity: UserId,
        addr: SocketAddr,
        profile: ProfileFields,
        now_tick: u64,
    ) -> Upsert {
        if self.local.same_username(identity.as_str()) {
            debug!(peer = %identity, "ignoring profile carrying our own username");
            return Upsert::SelfSuppressed;
        }
        let record = PeerRecord {
            user_id: identity.clone(),
            display_name: profile.display_name,
            status: profile.status,
            avatar: profile.avatar,
            addr,
            last_seen: now_tick,
        };
        match self.peers.insert(identity, record) {
            Some(_) => Upsert::Refreshed,
            None => {
                debug!(peer = %addr, "new peer in directory");
                Upsert::Inserted
            }
        }
    }

    /// Exact identity match first, then a case-insensitive match on the username part.
    pub fn resolve_address(&self, identity_or_username: &str) -> Option<SocketAddr> {
        self.resolve(identity_or_username).map(|p| p.addr)
    }

    pub fn resolve(&self, identity_or_username: &str) -> Option<&PeerRecord> {
        if let Some(p) = self.peers.get(&UserId::from_raw(identity_or_username)) {
            return Some(p);
        }
        let wanted = username_of(identity_or_username);
        self.peers
            .values()
            .find(|p| p.user_id.username().eq_ignore_ascii_case(wanted))
    }

    pub fn get(&self, identity: &UserId) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove peers not refreshed within `max_age` ticks. Returns the evicted identities.
    pub fn evict_stale(&mut self, now_tick: u64, max_age: u64) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .peers
            .values()
            .filter(|p| now_tick.saturating_sub(p.last_seen) > max_age)
            .map(|p| p.user_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
