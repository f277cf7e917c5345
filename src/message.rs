use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire discriminant for an ordinary chat payload.
pub const CHAT_TYPE: u32 = 0;
/// Wire discriminant for a join, answered with a roster snapshot.
pub const JOIN_TYPE: u32 = 1;
/// Wire discriminant for the roster notice sent when a member leaves.
pub const DISCONNECT_TYPE: u32 = 2;

/// One participant's identity, fixed by the first join of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
}

/// Inbound frame shape: a numeric discriminant plus free-form content.
///
/// Once `user` is stamped with the sender identity, the same shape is
/// re-encoded as the body of a relayed [`Envelope`]. Discriminants other
/// than the three known ones are relayed untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl MessageBody {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Extracts the joining user's identity from a join frame's content.
    ///
    /// `content` must carry a numeric `id` and a string `name`; anything
    /// else yields a typed error so the caller can drop the frame instead
    /// of crashing the connection.
    pub fn join_user(&self) -> Result<User, DecodeError> {
        let id = self
            .content
            .get("id")
            .ok_or(DecodeError::MissingField("id"))?
            .as_u64()
            .ok_or(DecodeError::InvalidField("id"))?;
        let name = self
            .content
            .get("name")
            .ok_or(DecodeError::MissingField("name"))?
            .as_str()
            .ok_or(DecodeError::InvalidField("name"))?
            .to_string();
        Ok(User { id, name })
    }
}

/// Outbound wire message. `body` is itself JSON-encoded, so clients decode
/// it according to `type`: a [`RosterBody`] for join/disconnect notices, the
/// stamped [`MessageBody`] for everything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: u32,
    pub body: String,
}

/// Body of a join or disconnect notice: the channel's current members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterBody {
    pub users: Vec<User>,
}

impl Envelope {
    pub fn roster(kind: u32, users: Vec<User>) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            body: serde_json::to_string(&RosterBody { users })?,
        })
    }

    pub fn stamped(body: &MessageBody) -> serde_json::Result<Self> {
        Ok(Self {
            kind: body.kind,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Why an inbound frame was dropped instead of forwarded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("join content is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("join content has a wrong-typed `{0}` field")]
    InvalidField(&'static str),
    #[error("client sent a message before joining")]
    NoIdentity,
}
