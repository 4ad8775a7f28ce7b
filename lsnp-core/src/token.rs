//! Capability tokens: `user_id|expiry_unix_time|scope`.
//!
//! Tokens are unsigned bearer credentials. A token authorizes an operation when it
//! has exactly three `|`-separated parts, its expiry has not passed, its scope
//! matches (case-insensitively), and it is not in the revocation set. Revocation
//! is a monotonic denylist: nothing is ever removed from it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use tracing::debug;

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Broadcast,
    Chat,
    File,
    Follow,
    Group,
    Game,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Broadcast => "broadcast",
            Scope::Chat => "chat",
            Scope::File => "file",
            Scope::Follow => "follow",
            Scope::Group => "group",
            Scope::Game => "game",
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
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Scope::Broadcast),
            "chat" => Ok(Scope::Chat),
            "file" => Ok(Scope::File),
            "follow" => Ok(Scope::Follow),
            "group" => Ok(Scope::Group),
            "game" => Ok(Scope::Game),
            _ => Err(TokenError::UnknownScope(s.to_string())),
        }
    }
}

/// A structurally valid token, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub user_id: String,
    pub expiry: u64,
    pub scope: String,
}

impl Token {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = raw.split('|').collect();
        let [user_id, expiry, scope] = parts.as_slice() else {
            return Err(TokenError::Malformed);
        };
        let expiry = expiry.parse::<u64>().map_err(|_| TokenError::BadExpiry)?;
        Ok(Token {
            user_id: user_id.to_string(),
            expiry,
            scope: scope.to_string(),
        })
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiry
    }
}

/// Build `user_id|now+ttl|scope`. The expiry is always a bare absolute timestamp.
pub fn issue(user_id: &str, ttl_seconds: u64, scope: Scope, now: u64) -> String {
    format!("{}|{}|{}", user_id, now.saturating_add(ttl_seconds), scope)
}

/// Whether `token` authorizes an operation of `expected` scope at `now`.
/// Never panics: malformed, empty, expired, wrong-scope and revoked tokens all yield false.
pub fn validate(token: &str, expected: Scope, now: u64, revoked: &HashSet<String>) -> bool {
    check(token, expected, now, revoked).is_ok()
}

fn check(token: &str, expected: Scope, now: u64, revoked: &HashSet<String>) -> Result<(), TokenError> {
    let parsed = Token::parse(token)?;
    if parsed.is_expired(now) {
        return Err(TokenError::Expired);
    }
    if !parsed.scope.eq_ignore_ascii_case(expected.as_str()) {
        return Err(TokenError::WrongScope);
    }
    if revoked.contains(token) {
        return Err(TokenError::Revoked);
    }
    Ok(())
}

/// Per-instance token state: tokens we issued, tokens granted to us, and the revocation set.
#[derive(Debug, Default)]
pub struct TokenStore {
    issued: HashMap<String, Token>,
    granted: HashMap<String, Token>,
    revoked: HashSet<String>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token and remember it, so it can be revoked on shutdown.
    pub fn issue(&mut self, user_id: &str, ttl_seconds: u64, scope: Scope, now: u64) -> String {
        let raw = issue(user_id, ttl_seconds, scope, now);
        self.issued.insert(
            raw.clone(),
            Token {
                user_id: user_id.to_string(),
                expiry: now.saturating_add(ttl_seconds),
                scope: scope.as_str().to_string(),
            },
        );
        raw
    }

    pub fn validate(&self, token: &str, expected: Scope, now: u64) -> bool {
        match check(token, expected, now, &self.revoked) {
            Ok(()) => true,
            Err(e) => {
                debug!(token, scope = %expected, reason = %e, "token rejected");
                false
            }
        }
    }

    /// Cache a token another peer granted us. Malformed or expired tokens are refused.
    pub fn store_granted(&mut self, raw: &str, now: u64) -> Result<(), TokenError> {
        let token = Token::parse(raw)?;
        if token.is_expired(now) {
            return Err(TokenError::Expired);
        }
        if self.revoked.contains(raw) {
            return Err(TokenError::Revoked);
        }
        self.granted.insert(raw.to_string(), token);
        Ok(())
    }

    /// Add to the revocation set and drop any cached copy. Returns true if newly revoked.
    pub fn revoke(&mut self, raw: &str) -> bool {
        self.issued.remove(raw);
        self.granted.remove(raw);
        self.revoked.insert(raw.to_string())
    }

    pub fn revoked(&self) -> &HashSet<String> {
        &self.revoked
    }

    /// Tokens issued locally that have not been revoked yet.
    pub fn issued(&self) -> impl Iterator<Item = &str> {
        self.issued.keys().map(String::as_str)
    }

    pub fn granted(&self) -> impl Iterator<Item = (&str, &Token)> {
        self.granted.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Forget locally issued tokens that are past their expiry.
    pub fn prune_expired(&mut self, now: u64) {
        self.issued.retain(|_, t| !t.is_expired(now));
        self.granted.retain(|_, t| !t.is_expired(now));
    }
}

/// Why a token did not authorize an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token does not have exactly three parts")]
    Malformed,
    #[error("token expiry is not an integer")]
    BadExpiry,
    #[error("token expired")]
    Expired,
    #[error("token scope does not match")]
    WrongScope,
    #[error("token revoked")]
    Revoked,
    #[error("unknown scope {0:?}")]
    UnknownScope(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn issued_token_format() {
        assert_eq!(
            issue("alice@10.0.0.5", 3600, Scope::Chat, NOW),
            "alice@10.0.0.5|1700003600|chat"
        );
    }

    #[test]
    fn valid_until_expiry_inclusive() {
        let revoked = HashSet::new();
        let t = issue("alice@10.0.0.5", 60, Scope::File, NOW);
        assert!(validate(&t, Scope::File, NOW, &revoked));
        assert!(validate(&t, Scope::File, NOW + 60, &revoked));
        assert!(!validate(&t, Scope::File, NOW + 61, &revoked));
    }

    #[test]
    fn scope_must_match_case_insensitively() {
        let revoked = HashSet::new();
        assert!(validate("bob@x|2000000000|CHAT", Scope::Chat, NOW, &revoked));
        assert!(!validate("bob@x|2000000000|chat", Scope::File, NOW, &revoked));
    }

    #[test]
    fn malformed_tokens_fail() {
        let revoked = HashSet::new();
        for raw in [
            "",
            "bob@x",
            "bob@x|2000000000",
            "bob@x|2000000000|chat|extra",
            "bob@x|soon|chat",
            "bob@x|-5|chat",
            "bob@x| 2000000000 |chat",
        ] {
            assert!(!validate(raw, Scope::Chat, NOW, &revoked), "{raw:?}");
        }
    }

    #[test]
    fn revoked_token_fails_for_every_scope_and_time() {
        let mut store = TokenStore::new();
        let t = store.issue("alice@10.0.0.5", 3600, Scope::Game, NOW);
        assert!(store.validate(&t, Scope::Game, NOW));
        assert!(store.revoke(&t));
        for scope in [Scope::Game, Scope::Chat, Scope::Broadcast] {
            assert!(!store.validate(&t, scope, NOW));
            assert!(!store.validate(&t, scope, 0));
        }
        assert!(!store.revoke(&t), "second revoke is a no-op");
        assert_eq!(store.issued().count(), 0);
    }

    #[test]
    fn granted_tokens_are_cached_and_evicted_on_revoke() {
        let mut store = TokenStore::new();
        let t = issue("me@10.0.0.1", 100, Scope::Chat, NOW);
        store.store_granted(&t, NOW).unwrap();
        assert_eq!(store.granted().count(), 1);
        store.revoke(&t);
        assert_eq!(store.granted().count(), 0);
        assert_eq!(store.store_granted(&t, NOW), Err(TokenError::Revoked));
    }

    #[test]
    fn expired_grant_is_refused() {
        let mut store = TokenStore::new();
        let t = issue("me@10.0.0.1", 10, Scope::Chat, NOW);
        assert_eq!(store.store_granted(&t, NOW + 11), Err(TokenError::Expired));
    }

    #[test]
    fn prune_drops_expired_issued_tokens() {
        let mut store = TokenStore::new();
        store.issue("me@10.0.0.1", 10, Scope::Chat, NOW);
        let long = store.issue("me@10.0.0.1", 1000, Scope::Chat, NOW);
        store.prune_expired(NOW + 11);
        assert_eq!(store.issued().collect::<Vec<_>>(), vec![long.as_str()]);
    }

    #[test]
    fn scope_parsing() {
        assert_eq!("FILE".parse::<Scope>().unwrap(), Scope::File);
        assert!("admin".parse::<Scope>().is_err());
    }
}
