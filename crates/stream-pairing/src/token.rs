//! Session tokens.
//!
//! A token is 32 bytes from the OS CSPRNG, URL-safe base64 on the wire.
//! Tokens carry an expiry and optionally a single-use flag; validation
//! compares in constant time against the stored table. Nothing here ever
//! touches the filesystem.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Default validity window for a freshly minted token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Raw token length in bytes (256 bits).
const TOKEN_LEN: usize = 32;

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidation {
    Valid,
    /// Unknown, malformed or empty token.
    Unknown,
    Expired,
    /// Single-use token that was already consumed.
    Consumed,
}

impl TokenValidation {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

struct TokenEntry {
    raw: [u8; TOKEN_LEN],
    created: Instant,
    expires: Instant,
    single_use: bool,
    consumed: bool,
    /// Room the token is bound to, when minted for a specific session.
    room: Option<String>,
}

/// In-memory token table.
///
/// Tokens live only for the process lifetime; there is deliberately no
/// persistence hook.
pub struct TokenStore {
    entries: Mutex<Vec<TokenEntry>>,
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Mint a token valid for `ttl`.
    pub fn mint(&self, ttl: Duration, single_use: bool, room: Option<String>) -> String {
        let mut raw = [0u8; TOKEN_LEN];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let encoded = URL_SAFE_NO_PAD.encode(raw);

        let now = Instant::now();
        self.lock().push(TokenEntry {
            raw,
            created: now,
            expires: now + ttl,
            single_use,
            consumed: false,
            room,
        });

        tracing::debug!(ttl_secs = ttl.as_secs(), single_use, "Minted session token");
        encoded
    }

    /// Validate a presented token, consuming it when single-use.
    ///
    /// The comparison runs over every stored entry in constant time per
    /// entry, so a mismatch cannot be distinguished from a match by
    /// timing.
    pub fn validate(&self, presented: &str) -> TokenValidation {
        self.validate_for_room(presented, None)
    }

    /// Validate and additionally require the token's room binding (when
    /// it has one) to match.
    pub fn validate_for_room(&self, presented: &str, room: Option<&str>) -> TokenValidation {
        let Some(raw) = decode_token(presented) else {
            return TokenValidation::Unknown;
        };

        let now = Instant::now();
        let mut entries = self.lock();
        let mut result = TokenValidation::Unknown;

        // Scan the whole table regardless of early matches.
        for entry in entries.iter_mut() {
            let matches =
                ring::constant_time::verify_slices_are_equal(&entry.raw, &raw).is_ok();
            if !matches {
                continue;
            }
            if let (Some(bound), Some(asked)) = (&entry.room, room) {
                if bound != asked {
                    result = TokenValidation::Unknown;
                    continue;
                }
            }
            if now > entry.expires {
                result = TokenValidation::Expired;
            } else if entry.consumed {
                result = TokenValidation::Consumed;
            } else {
                if entry.single_use {
                    entry.consumed = true;
                }
                result = TokenValidation::Valid;
            }
        }

        result
    }

    /// Extend or register an externally supplied token (the broker's
    /// host-token path) with the given TTL.
    pub fn register(&self, presented: &str, ttl: Duration) -> bool {
        let Some(raw) = decode_token(presented) else {
            return false;
        };
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| ring::constant_time::verify_slices_are_equal(&e.raw, &raw).is_ok())
        {
            entry.expires = now + ttl;
            return true;
        }
        entries.push(TokenEntry {
            raw,
            created: now,
            expires: now + ttl,
            single_use: false,
            consumed: false,
            room: None,
        });
        true
    }

    /// Drop expired entries. Run periodically (the broker sweeps every
    /// 30 s).
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| now <= e.expires && !(e.single_use && e.consumed));
        before - entries.len()
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Age of the oldest live token, for diagnostics.
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock().iter().map(|e| e.created.elapsed()).max()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TokenEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a presented token; `None` for anything that is not exactly a
/// 32-byte URL-safe base64 string (including the empty string).
fn decode_token(presented: &str) -> Option<[u8; TOKEN_LEN]> {
    if presented.is_empty() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(presented).ok()?;
    <[u8; TOKEN_LEN]>::try_from(decoded.as_slice()).ok()
}

/// Per-address sliding window limiter for connection attempts.
///
/// Used by the broker: more than `limit` attempts from one address inside
/// `window` get a 429-equivalent close.
pub struct AttemptLimiter {
    limit: usize,
    window: Duration,
    attempts: Mutex<HashMap<std::net::IpAddr, Vec<Instant>>>,
}

impl AttemptLimiter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt; `false` means the address is over its budget.
    pub fn allow(&self, addr: std::net::IpAddr) -> bool {
        let now = Instant::now();
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = attempts.entry(addr).or_default();
        entry.retain(|t| now.duration_since(*t) <= self.window);
        if entry.len() >= self.limit {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drop addresses with no recent attempts.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        attempts.retain(|_, entries| {
            entries.retain(|t| now.duration_since(*t) <= self.window);
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_validates_until_expiry() {
        let store = TokenStore::new();
        let token = store.mint(Duration::from_secs(60), false, None);
        assert!(store.validate(&token).is_valid());
        // Multi-use: validates again.
        assert!(store.validate(&token).is_valid());
    }

    #[test]
    fn expired_token_rejected() {
        let store = TokenStore::new();
        let token = store.mint(Duration::from_millis(0), false, None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.validate(&token), TokenValidation::Expired);
    }

    #[test]
    fn single_use_token_consumed() {
        let store = TokenStore::new();
        let token = store.mint(Duration::from_secs(60), true, None);
        assert!(store.validate(&token).is_valid());
        assert_eq!(store.validate(&token), TokenValidation::Consumed);
    }

    #[test]
    fn empty_and_garbage_tokens_rejected() {
        let store = TokenStore::new();
        store.mint(Duration::from_secs(60), false, None);
        assert_eq!(store.validate(""), TokenValidation::Unknown);
        assert_eq!(store.validate("not-base64!@#"), TokenValidation::Unknown);
        // Right alphabet, wrong length.
        assert_eq!(store.validate("YWJj"), TokenValidation::Unknown);
    }

    #[test]
    fn room_binding_enforced() {
        let store = TokenStore::new();
        let token = store.mint(Duration::from_secs(60), false, Some("room-a".into()));
        assert!(store
            .validate_for_room(&token, Some("room-a"))
            .is_valid());
        assert_eq!(
            store.validate_for_room(&token, Some("room-b")),
            TokenValidation::Unknown
        );
        // Unbound check still passes.
        assert!(store.validate(&token).is_valid());
    }

    #[test]
    fn sweep_removes_expired() {
        let store = TokenStore::new();
        store.mint(Duration::from_millis(0), false, None);
        store.mint(Duration::from_secs(60), false, None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let store = TokenStore::new();
        let a = store.mint(Duration::from_secs(60), false, None);
        let b = store.mint(Duration::from_secs(60), false, None);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 32 bytes, unpadded base64.
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn register_accepts_external_token() {
        let store = TokenStore::new();
        let external = URL_SAFE_NO_PAD.encode([7u8; 32]);
        assert!(store.register(&external, Duration::from_secs(60)));
        assert!(store.validate(&external).is_valid());
        // Re-register extends rather than duplicating.
        assert!(store.register(&external, Duration::from_secs(120)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn attempt_limiter_caps_per_address() {
        let limiter = AttemptLimiter::new(3, Duration::from_secs(60));
        let addr: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(!limiter.allow(addr));
        // A different address is unaffected.
        let other: std::net::IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.allow(other));
    }
}
