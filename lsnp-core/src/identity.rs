//! Identities (`name@address`), the local profile, and message/file id generation.

use std::fmt;

use rand::Rng;

/// A `user_id` of the form `name@address`. The address part is informational only:
/// replies go to the address the transport observed, never the claimed one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(username: &str, address: &str) -> Self {
        UserId(format!("{username}@{address}"))
    }

    /// Wrap a raw identity string as received on the wire.
    pub fn from_raw(raw: &str) -> Self {
        UserId(raw.to_string())
    }

    /// Portion before the first `@` (the whole string if there is none).
    pub fn username(&self) -> &str {
        username_of(&self.0)
    }

    /// Claimed address after the `@`, if any.
    pub fn claimed_address(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, addr)| addr)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison of the username parts.
    pub fn same_username(&self, other: &str) -> bool {
        self.username().eq_ignore_ascii_case(username_of(other))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn username_of(identity: &str) -> &str {
    identity
        .split_once('@')
        .map(|(name, _)| name)
        .unwrap_or(identity)
}

/// What this peer announces about itself in PROFILE messages.
#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
}

impl LocalProfile {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            status: "Online".to_string(),
            avatar: None,
        }
    }
}

/// Optional avatar carried inline in PROFILE (already encoded by the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub mime_type: String,
    pub encoding: String,
    pub data: String,
}

/// New message id: a random 64-bit value as 16 lowercase hex digits.
pub fn generate_message_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// New file id: a v4 UUID in simple (32 hex digit) form.
pub fn generate_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parts() {
        let id = UserId::new("alice", "10.0.0.5");
        assert_eq!(id.as_str(), "alice@10.0.0.5");
        assert_eq!(id.username(), "alice");
        assert_eq!(id.claimed_address(), Some("10.0.0.5"));
    }

    #[test]
    fn bare_username_has_no_address() {
        let id = UserId::from_raw("carol");
        assert_eq!(id.username(), "carol");
        assert_eq!(id.claimed_address(), None);
    }

    #[test]
    fn username_comparison_ignores_case_and_address() {
        let id = UserId::new("Alice", "10.0.0.5");
        assert!(id.same_username("alice@192.168.1.9"));
        assert!(id.same_username("ALICE"));
        assert!(!id.same_username("alicia@10.0.0.5"));
    }

    #[test]
    fn message_ids_are_fixed_width_hex() {
        let id = generate_message_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_message_id(), generate_message_id());
    }

    #[test]
    fn file_ids_are_unique() {
        let a = generate_file_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, generate_file_id());
    }
}
