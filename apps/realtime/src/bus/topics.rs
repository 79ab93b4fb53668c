//! Topic naming: subscription destinations, probe destinations, and the keys
//! the registry uses to deduplicate subscriptions.

use std::fmt;

use serde_json::{json, Value};

pub type UserId = i64;
pub type TravelId = i64;
pub type RoomId = i64;

/// An independent unread-count stream feeding the badge total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Messages,
    Invitations,
    JoinRequests,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Messages, Source::Invitations, Source::JoinRequests];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Invitations => "invitations",
            Self::JoinRequests => "joinRequests",
        }
    }

    /// Field carrying the count in this source's payloads.
    pub fn count_field(self) -> &'static str {
        match self {
            Self::Messages => "messagesCount",
            Self::Invitations => "invitationsCount",
            Self::JoinRequests => "requestsCount",
        }
    }

    pub fn topic(self, user_id: UserId) -> Topic {
        Topic::UnreadCounter {
            source: self,
            user_id,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic the client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// User-level unread counter for one source.
    UnreadCounter { source: Source, user_id: UserId },
    /// Unread join requests for one travel the viewer created.
    TravelRequests { travel_id: TravelId },
    /// Live messages of one chat room.
    ChatRoom { room_id: RoomId },
    /// Last-message / unread updates of one room, for one viewer.
    ChatRoomUnread { room_id: RoomId, user_id: UserId },
}

/// A zero-count publish that asks the broker to reset and re-emit a counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub destination: String,
    pub payload: Value,
}

impl Topic {
    pub fn destination(&self) -> String {
        match *self {
            Topic::UnreadCounter {
                source: Source::Messages,
                user_id,
            } => format!("/unread-topic/chats/user/{user_id}"),
            Topic::UnreadCounter {
                source: Source::Invitations,
                user_id,
            } => format!("/unread-topic/invitations/user/{user_id}"),
            Topic::UnreadCounter {
                source: Source::JoinRequests,
                user_id,
            } => format!("/unread-topic/user/{user_id}/travels/requests"),
            Topic::TravelRequests { travel_id } => {
                format!("/unread-topic/travel/{travel_id}/requests")
            }
            Topic::ChatRoom { room_id } => format!("/chat-room/{room_id}"),
            Topic::ChatRoomUnread { room_id, user_id } => {
                format!("/unread-topic/chat-rooms/{room_id}/user/{user_id}")
            }
        }
    }

    /// The probe published right after subscribing, for counter topics.
    pub fn probe(&self) -> Option<Probe> {
        let (destination, field) = match *self {
            Topic::UnreadCounter {
                source: Source::Messages,
                user_id,
            } => (format!("/app/chats/user/{user_id}"), Source::Messages.count_field()),
            Topic::UnreadCounter {
                source: Source::Invitations,
                user_id,
            } => (
                format!("/app/invitations/user/{user_id}"),
                Source::Invitations.count_field(),
            ),
            Topic::UnreadCounter {
                source: Source::JoinRequests,
                user_id,
            } => (
                format!("/app/user/{user_id}/travels/requests"),
                Source::JoinRequests.count_field(),
            ),
            Topic::TravelRequests { travel_id } => (
                format!("/app/travel/{travel_id}/requests"),
                Source::JoinRequests.count_field(),
            ),
            Topic::ChatRoom { .. } | Topic::ChatRoomUnread { .. } => return None,
        };
        Some(Probe {
            destination,
            payload: json!({ field: 0 }),
        })
    }

    pub fn key(&self) -> SubscriptionKey {
        match *self {
            Topic::UnreadCounter { source, user_id } => SubscriptionKey {
                kind: TopicKind::UnreadCounter(source),
                resource_id: user_id,
                viewer_id: Some(user_id),
            },
            Topic::TravelRequests { travel_id } => SubscriptionKey {
                kind: TopicKind::TravelRequests,
                resource_id: travel_id,
                viewer_id: None,
            },
            Topic::ChatRoom { room_id } => SubscriptionKey {
                kind: TopicKind::ChatRoom,
                resource_id: room_id,
                viewer_id: None,
            },
            Topic::ChatRoomUnread { room_id, user_id } => SubscriptionKey {
                kind: TopicKind::ChatRoomUnread,
                resource_id: room_id,
                viewer_id: Some(user_id),
            },
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

/// Destination for outgoing chat messages of a room.
pub fn chat_send_destination(room_id: RoomId) -> String {
    format!("/app/chat/{room_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    UnreadCounter(Source),
    TravelRequests,
    ChatRoom,
    ChatRoomUnread,
}

/// Identity of a subscription: (resource kind, resource id, viewer id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: TopicKind,
    pub resource_id: i64,
    pub viewer_id: Option<UserId>,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.viewer_id {
            Some(viewer) => write!(f, "{:?}/{}@{}", self.kind, self.resource_id, viewer),
            None => write!(f, "{:?}/{}", self.kind, self.resource_id),
        }
    }
}
