//! Capability token issuing for channel attach
//!
//! The relay hands out short-lived random tokens bound to a client id and a
//! capability pattern. A token is only checked when a connection attaches to
//! a channel; an attached connection keeps its channel until it detaches or
//! times out.

use log::{debug, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

const TOKEN_LENGTH: usize = 32;

/// Unredeemed tokens kept at once; the soonest to expire is dropped past this
pub const MAX_OUTSTANDING_TOKENS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    UnknownToken,
    Expired,
    ChannelNotPermitted { channel: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::UnknownToken => write!(f, "Unknown token"),
            AuthError::Expired => write!(f, "Token expired"),
            AuthError::ChannelNotPermitted { channel } => {
                write!(f, "Token not permitted on channel {}", channel)
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// A granted capability as returned to the requesting client
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: String,
    pub client_id: String,
    pub capability: String,
    pub expires_at: u64,
}

#[derive(Debug)]
struct IssuedToken {
    client_id: String,
    expires: Instant,
}

pub struct TokenIssuer {
    tokens: HashMap<String, IssuedToken>,
    capability: String,
    ttl: Duration,
    max_tokens: usize,
}

impl TokenIssuer {
    /// `capability` is `*`, an exact channel name, or a `prefix*` namespace.
    pub fn new(capability: &str, ttl: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            capability: capability.to_string(),
            ttl,
            max_tokens: MAX_OUTSTANDING_TOKENS,
        }
    }

    pub fn with_limit(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// Issues a token for the requested client id, or for a generated one.
    pub fn issue(&mut self, requested_client_id: Option<String>) -> TokenGrant {
        self.prune_expired();

        let client_id = requested_client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("user-{}", random_string(7).to_ascii_lowercase()));
        let token = random_string(TOKEN_LENGTH);

        while self.tokens.len() >= self.max_tokens {
            let Some(oldest) = self
                .tokens
                .iter()
                .min_by_key(|(_, issued)| issued.expires)
                .map(|(token, _)| token.clone())
            else {
                break;
            };
            debug!("Token limit reached, dropping the oldest");
            self.tokens.remove(&oldest);
        }

        self.tokens.insert(
            token.clone(),
            IssuedToken {
                client_id: client_id.clone(),
                expires: Instant::now() + self.ttl,
            },
        );
        info!("Issued token for client {}", client_id);

        TokenGrant {
            token,
            client_id,
            capability: self.capability.clone(),
            expires_at: shared::timestamp_ms() + self.ttl.as_millis() as u64,
        }
    }

    /// Checks a token against a channel and returns the client id it was issued to.
    pub fn verify(&self, token: &str, channel: &str) -> Result<String, AuthError> {
        let issued = self.tokens.get(token).ok_or(AuthError::UnknownToken)?;

        if Instant::now() >= issued.expires {
            return Err(AuthError::Expired);
        }

        if !capability_allows(&self.capability, channel) {
            return Err(AuthError::ChannelNotPermitted {
                channel: channel.to_string(),
            });
        }

        Ok(issued.client_id.clone())
    }

    pub fn prune_expired(&mut self) {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, issued| issued.expires > now);

        let removed = before - self.tokens.len();
        if removed > 0 {
            debug!("Pruned {} expired tokens", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Matches a channel name against a capability pattern.
pub fn capability_allows(capability: &str, channel: &str) -> bool {
    match capability.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => capability == channel,
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
