//! Message envelope protocol
//!
//! A single flat JSON envelope tagged by `type`. Only the fields relevant to a
//! kind are populated; absent fields are omitted on encode and unknown fields
//! are ignored on decode. Decoding and validation are separate steps so a
//! malformed frame and an incomplete one can be told apart.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, ValidationError};
use crate::history::HistoryEntry;
use crate::types::{Identity, UserId};

/// Envelope kinds, serialized in snake_case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// User joining the messaging system
    Join,
    /// User leaving the messaging system
    Leave,
    /// Private message between two users
    PrivateMessage,
    /// Request for a page of conversation history
    LoadHistory,
    /// Response carrying a page of conversation history
    HistoryLoaded,
    /// A user's first connection came up
    UserOnline,
    /// A user's last connection went away
    UserOffline,
    /// Snapshot of online display names
    OnlineUsers,
    /// At least one recipient connection accepted the message
    MessageDelivered,
    /// Recipient unreachable or every recipient connection saturated
    MessageFailed,
    /// Copy of a sender's own message for their other sessions
    MessageEcho,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::PrivateMessage => "private_message",
            EnvelopeKind::LoadHistory => "load_history",
            EnvelopeKind::HistoryLoaded => "history_loaded",
            EnvelopeKind::UserOnline => "user_online",
            EnvelopeKind::UserOffline => "user_offline",
            EnvelopeKind::OnlineUsers => "online_users",
            EnvelopeKind::MessageDelivered => "message_delivered",
            EnvelopeKind::MessageFailed => "message_failed",
            EnvelopeKind::MessageEcho => "message_echo",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire and internal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<UserId>,

    /// Recipient, or the other party of a history page
    #[serde(alias = "with_user_id", skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,

    /// Sender display name
    #[serde(
        rename = "nickname",
        alias = "display_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,

    /// RFC 3339 timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Identifier assigned by the persistence collaborator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,

    /// History paging offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,

    /// Online display names (online_users only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,

    /// History page (history_loaded only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<HistoryEntry>>,
}

/// Current time in the envelope timestamp format
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Envelope {
    /// Envelope of the given kind with every field unset
    pub fn empty(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            content: None,
            from_user_id: None,
            to_user_id: None,
            display_name: None,
            timestamp: None,
            message_id: None,
            offset: None,
            users: None,
            messages: None,
        }
    }

    /// Parse one frame
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize for the transport
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Check the fields required by this envelope's kind
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.kind {
            EnvelopeKind::PrivateMessage => {
                if self.content.as_deref().map_or(true, str::is_empty) {
                    return Err(ValidationError::MissingContent(self.kind));
                }
                self.require_participants()
            }
            EnvelopeKind::LoadHistory => self.require_participants(),
            _ => Ok(()),
        }
    }

    fn require_participants(&self) -> Result<(), ValidationError> {
        if !self.to_user_id.is_some_and(UserId::is_valid) {
            return Err(ValidationError::MissingRecipient(self.kind));
        }
        if !self.from_user_id.is_some_and(UserId::is_valid) {
            return Err(ValidationError::MissingSender(self.kind));
        }
        Ok(())
    }

    /// Overwrite the sender fields with the connection's bound identity
    ///
    /// Sender fields on the wire are never trusted.
    pub fn stamp_sender(&mut self, identity: &Identity) {
        self.from_user_id = Some(identity.user_id);
        self.display_name = Some(identity.display_name.clone());
        if self.timestamp.is_none() {
            self.timestamp = Some(now_rfc3339());
        }
    }

    /// Clear fields a client has no business setting for this kind
    ///
    /// Keeps a private message from carrying a forged user list or history
    /// page through to its recipient.
    pub fn strip_foreign_fields(&mut self) {
        match self.kind {
            EnvelopeKind::PrivateMessage => {
                self.users = None;
                self.messages = None;
                self.offset = None;
            }
            EnvelopeKind::LoadHistory => {
                self.users = None;
                self.messages = None;
                self.content = None;
            }
            _ => {}
        }
    }

    pub fn user_online(identity: &Identity) -> Self {
        Self::presence(EnvelopeKind::UserOnline, identity)
    }

    pub fn user_offline(identity: &Identity) -> Self {
        Self::presence(EnvelopeKind::UserOffline, identity)
    }

    fn presence(kind: EnvelopeKind, identity: &Identity) -> Self {
        Self {
            from_user_id: Some(identity.user_id),
            display_name: Some(identity.display_name.clone()),
            timestamp: Some(now_rfc3339()),
            ..Self::empty(kind)
        }
    }

    pub fn online_users(names: Vec<String>) -> Self {
        Self {
            users: Some(names),
            timestamp: Some(now_rfc3339()),
            ..Self::empty(EnvelopeKind::OnlineUsers)
        }
    }

    pub fn message_delivered(to_user_id: Option<UserId>, message_id: Option<i64>) -> Self {
        Self {
            to_user_id,
            message_id,
            ..Self::empty(EnvelopeKind::MessageDelivered)
        }
    }

    pub fn message_failed(to_user_id: Option<UserId>, message_id: Option<i64>) -> Self {
        Self {
            to_user_id,
            message_id,
            ..Self::empty(EnvelopeKind::MessageFailed)
        }
    }

    /// History page for the conversation with `with_user_id`
    pub fn history_loaded(with_user_id: UserId, offset: u32, entries: Vec<HistoryEntry>) -> Self {
        Self {
            to_user_id: Some(with_user_id),
            offset: Some(offset),
            messages: Some(entries),
            ..Self::empty(EnvelopeKind::HistoryLoaded)
        }
    }

    /// Copy of this message for the sender's other sessions
    pub fn to_echo(&self) -> Self {
        Self {
            kind: EnvelopeKind::MessageEcho,
            ..self.clone()
        }
    }
}
