//! Identity resolution at handshake time
//!
//! The hub never sees credentials. Before a WebSocket upgrade is accepted the
//! session token is pulled out of the request and handed to an
//! `IdentityResolver`; an unknown token rejects the upgrade.

use std::collections::HashMap;
use std::str::FromStr;

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;

use crate::error::ConfigError;
use crate::types::{Identity, UserId};

/// Cookie carrying the session token
pub const SESSION_COOKIE: &str = "session_token";

/// Query parameter carrying the session token
pub const TOKEN_PARAM: &str = "token";

/// Maps a validated session token to the user it belongs to
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Identity>;
}

/// Session token from the `session_token` cookie, else the `token` query parameter
pub fn session_token(request: &Request) -> Option<String> {
    let from_cookie = request
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string());

    from_cookie.or_else(|| {
        request
            .uri()
            .query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == TOKEN_PARAM)
            .map(|(_, value)| value.to_string())
    })
    .filter(|token| !token.is_empty())
}

/// One configured session: `TOKEN:USER_ID:NAME`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub token: String,
    pub identity: Identity,
}

impl FromStr for SessionEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSession(s.to_string());

        let mut parts = s.splitn(3, ':');
        let token = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;
        let user_id = parts
            .next()
            .and_then(|id| id.parse::<i64>().ok())
            .map(UserId)
            .filter(|id| id.is_valid())
            .ok_or_else(invalid)?;
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            token: token.to_string(),
            identity: Identity::new(user_id, name),
        })
    }
}

/// In-memory token table
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, Identity>,
}

impl StaticSessions {
    pub fn new(entries: impl IntoIterator<Item = SessionEntry>) -> Self {
        Self {
            sessions: entries
                .into_iter()
                .map(|entry| (entry.token, entry.identity))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl IdentityResolver for StaticSessions {
    fn resolve(&self, token: &str) -> Option<Identity> {
        self.sessions.get(token).cloned()
    }
}
