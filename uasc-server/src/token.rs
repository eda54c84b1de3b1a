//! The token manager: allocates token ids, revises requested lifetimes and
//! tracks the expiry watchdog for the current and previous token.

use log::{debug, warn};
use tokio::time::Instant;

use uasc_types::{ChannelSecurityToken, DateTime};

/// Numerator of the grace factor applied on top of a token's lifetime. The
/// watchdog fires at 120% of the revised lifetime: clients are expected to
/// renew well before expiry, and the grace absorbs clock skew and messages
/// in flight across the renewal.
const LIFETIME_GRACE_PERCENT: u64 = 20;

#[derive(Debug)]
struct IssuedToken {
    token: ChannelSecurityToken,
    watchdog_deadline: Instant,
    expired: bool,
}

/// Allocates security tokens on a channel and tracks their expiry.
///
/// Token ids are strictly increasing starting at 1. At most two tokens are
/// recognised at a time: the current one, and its predecessor during the
/// renewal grace window.
#[derive(Debug)]
pub struct TokenManager {
    last_token_id: u32,
    default_lifetime: u32,
    current: Option<IssuedToken>,
    previous: Option<IssuedToken>,
}

impl TokenManager {
    /// Create a token manager with the supplied default lifetime in
    /// milliseconds.
    pub fn new(default_lifetime: u32) -> TokenManager {
        debug_assert!(default_lifetime > 0);
        TokenManager {
            last_token_id: 0,
            default_lifetime,
            current: None,
            previous: None,
        }
    }

    /// The lifetime granted for a requested lifetime: the server default
    /// when the request is zero, otherwise the request capped at the server
    /// default.
    pub fn revised_lifetime(&self, requested_lifetime: u32) -> u32 {
        if requested_lifetime == 0 {
            self.default_lifetime
        } else {
            requested_lifetime.min(self.default_lifetime)
        }
    }

    /// Issue the first token of a channel.
    pub fn issue(
        &mut self,
        secure_channel_id: u32,
        requested_lifetime: u32,
    ) -> ChannelSecurityToken {
        let token = self.make_token(secure_channel_id, requested_lifetime);
        debug!(
            "Issued token {} on channel {} with lifetime {}",
            token.token_id, token.channel_id, token.revised_lifetime
        );
        token
    }

    /// Renew the token of a channel. Identical to issuing apart from the
    /// reported intent; the predecessor token stays recognised for the grace
    /// window.
    pub fn renew(
        &mut self,
        secure_channel_id: u32,
        requested_lifetime: u32,
    ) -> ChannelSecurityToken {
        let token = self.make_token(secure_channel_id, requested_lifetime);
        debug!(
            "Renewed token {} on channel {} with lifetime {}",
            token.token_id, token.channel_id, token.revised_lifetime
        );
        token
    }

    fn make_token(
        &mut self,
        secure_channel_id: u32,
        requested_lifetime: u32,
    ) -> ChannelSecurityToken {
        let revised_lifetime = self.revised_lifetime(requested_lifetime);
        self.last_token_id += 1;
        let token = ChannelSecurityToken {
            channel_id: secure_channel_id,
            token_id: self.last_token_id,
            created_at: DateTime::now(),
            revised_lifetime,
        };
        let watchdog_deadline = Instant::now()
            + std::time::Duration::from_millis(
                (revised_lifetime as u64) * (100 + LIFETIME_GRACE_PERCENT) / 100,
            );
        // The old watchdog is implicitly cancelled, the previous token keeps
        // only its own deadline
        self.previous = self.current.take();
        self.current = Some(IssuedToken {
            token: token.clone(),
            watchdog_deadline,
            expired: false,
        });
        token
    }

    /// The id of the active token, 0 before the first issue.
    pub fn current_token_id(&self) -> u32 {
        self.current.as_ref().map_or(0, |t| t.token.token_id)
    }

    /// The earliest pending watchdog deadline, or `None` when every known
    /// token has already expired.
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .filter(|t| !t.expired)
            .map(|t| t.watchdog_deadline)
            .min()
    }

    /// Flip the expired flag on tokens whose deadline has passed. Firing
    /// does not close the channel by itself, subsequent requests secured
    /// with an expired token are refused instead.
    pub fn on_watchdog_fired(&mut self) {
        let now = Instant::now();
        for slot in [&mut self.current, &mut self.previous] {
            if let Some(token) = slot {
                if !token.expired && token.watchdog_deadline <= now {
                    warn!(
                        "Security token {} on channel {} has passed its lifetime and is now expired",
                        token.token.token_id, token.token.channel_id
                    );
                    token.expired = true;
                }
            }
        }
    }

    /// `true` when `token_id` is the current or previous token and its
    /// watchdog has not expired it.
    pub fn is_token_valid(&self, token_id: u32) -> bool {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .any(|t| t.token.token_id == token_id && !t.expired)
    }

    /// Called when the remote side secures a message with `token_id`. Once
    /// the newest token is in use its predecessor is dropped.
    pub fn mark_token_used(&mut self, token_id: u32) {
        if self.current_token_id() == token_id && self.previous.is_some() {
            self.previous = None;
        }
    }

    /// Drop every token, cancelling the watchdog. Used on channel abort.
    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: u32 = 600_000;

    #[test]
    fn lifetime_revision() {
        let tokens = TokenManager::new(DEFAULT);
        // Zero means server default
        assert_eq!(tokens.revised_lifetime(0), DEFAULT);
        // Requests are capped at the default
        assert_eq!(tokens.revised_lifetime(DEFAULT + 1), DEFAULT);
        assert_eq!(tokens.revised_lifetime(DEFAULT), DEFAULT);
        // Anything below passes through
        assert_eq!(tokens.revised_lifetime(1), 1);
        assert_eq!(tokens.revised_lifetime(30_000), 30_000);
    }

    #[test]
    fn token_ids_strictly_increase() {
        let mut tokens = TokenManager::new(DEFAULT);
        let first = tokens.issue(9, 0);
        assert_eq!(first.token_id, 1);
        assert_eq!(first.revised_lifetime, DEFAULT);
        let second = tokens.renew(9, 0);
        assert_eq!(second.token_id, 2);
        let third = tokens.renew(9, 0);
        assert_eq!(third.token_id, 3);
        assert_eq!(tokens.current_token_id(), 3);
    }

    #[test]
    fn watchdog_fires_at_120_percent() {
        let mut tokens = TokenManager::new(DEFAULT);
        let before = Instant::now();
        tokens.issue(1, 1000);
        let deadline = tokens.watchdog_deadline().unwrap();
        let grace = deadline - before;
        // 1000ms * 1.2 = 1200ms, allow 10ms of slack for the test itself
        assert!(grace >= std::time::Duration::from_millis(1190));
        assert!(grace <= std::time::Duration::from_millis(1210));
    }

    #[test]
    fn both_tokens_valid_during_grace() {
        let mut tokens = TokenManager::new(DEFAULT);
        tokens.issue(1, 0);
        tokens.renew(1, 0);
        assert!(tokens.is_token_valid(1));
        assert!(tokens.is_token_valid(2));
        assert!(!tokens.is_token_valid(3));

        // Using the new token drops the old one
        tokens.mark_token_used(2);
        assert!(!tokens.is_token_valid(1));
        assert!(tokens.is_token_valid(2));
    }

    #[test]
    fn only_two_tokens_are_recognised() {
        let mut tokens = TokenManager::new(DEFAULT);
        tokens.issue(1, 0);
        tokens.renew(1, 0);
        tokens.renew(1, 0);
        assert!(!tokens.is_token_valid(1));
        assert!(tokens.is_token_valid(2));
        assert!(tokens.is_token_valid(3));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refused() {
        let mut tokens = TokenManager::new(DEFAULT);
        tokens.issue(1, 1000);
        assert!(tokens.is_token_valid(1));

        // Jump past the watchdog deadline
        tokio::time::advance(std::time::Duration::from_millis(1201)).await;
        tokens.on_watchdog_fired();
        assert!(!tokens.is_token_valid(1));
        assert!(tokens.watchdog_deadline().is_none());
    }
}
