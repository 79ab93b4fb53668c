//! REST collaborator for chat rooms and history.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::models::{ChatRoom, Message, MessageDto, RoomDto};
use crate::bus::topics::{RoomId, UserId};
use crate::error::{RealtimeError, Result};

/// Read-side chat API. The session only depends on this trait so tests can
/// substitute an in-memory fake.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /chats/rooms`
    async fn list_rooms(&self) -> Result<Vec<ChatRoom>>;

    /// `GET /chats/rooms/{id}/messages`, oldest first.
    async fn room_messages(&self, room_id: RoomId) -> Result<Vec<Message>>;

    /// `POST /chats/rooms/user/{userId}`: find or create the room with a user.
    async fn create_room_with(&self, user_id: UserId) -> Result<ChatRoom>;
}

#[derive(Clone)]
pub struct HttpChatApi {
    api_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn read<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let resp = request.bearer_auth(&self.token).send().await?;
        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(RealtimeError::auth(format!("chat api answered {}", resp.status())));
        }
        Ok(resp.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_rooms(&self) -> Result<Vec<ChatRoom>> {
        let url = format!("{}/chats/rooms", self.api_url);
        tracing::debug!(%url, "fetching chat rooms");
        let rooms: Vec<RoomDto> = self.read(self.http.get(&url)).await?;
        Ok(rooms.into_iter().map(ChatRoom::from).collect())
    }

    async fn room_messages(&self, room_id: RoomId) -> Result<Vec<Message>> {
        let url = format!("{}/chats/rooms/{room_id}/messages", self.api_url);
        tracing::debug!(%url, "fetching chat history");
        let messages: Vec<MessageDto> = self.read(self.http.get(&url)).await?;
        Ok(messages.into_iter().map(Message::from).collect())
    }

    async fn create_room_with(&self, user_id: UserId) -> Result<ChatRoom> {
        let url = format!("{}/chats/rooms/user/{user_id}", self.api_url);
        tracing::info!(%url, "opening chat room");
        let room: RoomDto = self
            .read(self.http.post(&url).json(&serde_json::json!({})))
            .await?;
        Ok(room.into())
    }
}
