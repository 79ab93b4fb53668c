//! Chat DTOs as the REST API and the broker send them, and the domain types
//! the session keeps.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::bus::topics::{RoomId, UserId};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderRef {
    pub id: UserId,
}

/// A message as `GET /chats/rooms/{id}/messages` and `/chat-room/{id}`
/// deliver it. Also the shape of a room's `lastMessage`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageDto {
    pub sender: SenderRef,
    pub content: String,
    #[serde(deserialize_with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// An entry of `GET /chats/rooms`, or the body of `POST /chats/rooms/user/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDto {
    pub id: RoomId,
    pub user: UserRef,
    #[serde(default)]
    pub last_message: Option<MessageDto>,
    #[serde(default)]
    pub unread: bool,
}

/// Body pushed on `/unread-topic/chat-rooms/{room}/user/{viewer}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUnreadUpdate {
    #[serde(default)]
    pub last_message: Option<MessageDto>,
    #[serde(default)]
    pub unread: bool,
}

/// Payload published to `/app/chat/{room}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
}

/// Accept RFC 3339 as well as zone-less `2024-05-01T12:30:45.123`, read as UTC.
fn wire_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Which side of the conversation a message renders on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Mine,
    Theirs,
}

/// An id-less chat record. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn side(&self, viewer: UserId) -> Side {
        if self.sender_id == viewer {
            Side::Mine
        } else {
            Side::Theirs
        }
    }
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        Self {
            sender_id: dto.sender.id,
            content: dto.content,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRoom {
    pub id: RoomId,
    pub counterpart: UserRef,
    pub last_message: Option<Message>,
    pub unread: bool,
}

impl ChatRoom {
    /// Sidebar subtitle: the last message, prefixed with `You: ` when the
    /// viewer sent it.
    pub fn preview(&self, viewer: UserId) -> Option<String> {
        self.last_message.as_ref().map(|m| match m.side(viewer) {
            Side::Mine => format!("You: {}", m.content),
            Side::Theirs => m.content.clone(),
        })
    }

    /// Apply a pushed unread update. A missing `lastMessage` keeps the old
    /// snapshot and only changes the unread flag.
    pub fn apply(&mut self, update: RoomUnreadUpdate) {
        if let Some(last) = update.last_message {
            self.last_message = Some(last.into());
        }
        self.unread = update.unread;
    }
}

impl From<RoomDto> for ChatRoom {
    fn from(dto: RoomDto) -> Self {
        Self {
            id: dto.id,
            counterpart: dto.user,
            last_message: dto.last_message.map(Message::from),
            unread: dto.unread,
        }
    }
}

/// A message appended to a live room, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub room_id: RoomId,
    pub message: Message,
}
