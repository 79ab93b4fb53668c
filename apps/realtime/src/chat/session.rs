//! Per-conversation chat state: room list, selected room, message sequence.
//!
//! Selecting a room registers its live topic before the history fetch, so
//! messages pushed while the fetch is in flight are buffered and merged in
//! once history arrives. Every selection bumps an epoch; any history result
//! or delivery tagged with an older epoch is stale and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::api::ChatApi;
use super::models::{ChatRoom, Message, MessageDto, OutgoingMessage, RoomMessage, RoomUnreadUpdate};
use crate::bus::connection::{Delivery, Handler, SubscriptionHandle};
use crate::bus::registry::SubscriptionRegistry;
use crate::bus::topics::{chat_send_destination, RoomId, Topic, TopicKind, UserId};
use crate::error::{RealtimeError, Result};

/// Slow receivers that fall behind skip messages (`RecvError::Lagged`).
const APPEND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    NoRoomSelected,
    LoadingHistory { room_id: RoomId },
    Live { room_id: RoomId },
    /// Left; the sequence stays readable as cached history.
    Closed { room_id: RoomId },
}

impl RoomState {
    fn active_room(&self) -> Option<RoomId> {
        match *self {
            RoomState::LoadingHistory { room_id } | RoomState::Live { room_id } => Some(room_id),
            RoomState::NoRoomSelected | RoomState::Closed { .. } => None,
        }
    }
}

/// Position in the message sequence for [`ChatRoomSession::messages_since`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    sequence: u64,
    offset: usize,
}

/// How [`ChatRoomSession::select_room`] proceeds after inspecting the state.
enum Selection {
    Ready,
    Await(watch::Receiver<RoomState>),
    Begin { epoch: u64, previous: Option<RoomId> },
}

struct Inner {
    state: RoomState,
    state_tx: watch::Sender<RoomState>,
    /// Bumped on every select and leave.
    epoch: u64,
    /// Bumped whenever `messages` is replaced rather than appended to.
    sequence: u64,
    rooms: Vec<ChatRoom>,
    messages: Vec<Message>,
    /// Live deliveries received while history is loading.
    pending: Vec<Message>,
    cache: HashMap<RoomId, Vec<Message>>,
}

impl Inner {
    fn room_mut(&mut self, room_id: RoomId) -> Option<&mut ChatRoom> {
        self.rooms.iter_mut().find(|r| r.id == room_id)
    }

    fn set_state(&mut self, state: RoomState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Move the active room to CLOSED, caching its sequence.
    fn close_active(&mut self) -> Option<RoomId> {
        let room_id = self.state.active_room()?;
        self.cache.insert(room_id, self.messages.clone());
        self.pending.clear();
        self.set_state(RoomState::Closed { room_id });
        self.epoch += 1;
        Some(room_id)
    }

    fn reset_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.sequence += 1;
    }
}

pub struct ChatRoomSession {
    viewer: UserId,
    registry: Arc<SubscriptionRegistry>,
    api: Arc<dyn ChatApi>,
    inner: Mutex<Inner>,
    /// Held while the room topic is swapped, so a leave cannot interleave
    /// with a selection between the state change and the registry update.
    room_topic: Mutex<()>,
    appended: broadcast::Sender<Arc<RoomMessage>>,
}

impl ChatRoomSession {
    pub fn new(viewer: UserId, registry: Arc<SubscriptionRegistry>, api: Arc<dyn ChatApi>) -> Arc<Self> {
        let (appended, _) = broadcast::channel(APPEND_CAPACITY);
        let (state_tx, _) = watch::channel(RoomState::NoRoomSelected);
        Arc::new(Self {
            viewer,
            registry,
            api,
            inner: Mutex::new(Inner {
                state: RoomState::NoRoomSelected,
                state_tx,
                epoch: 0,
                sequence: 0,
                rooms: Vec::new(),
                messages: Vec::new(),
                pending: Vec::new(),
                cache: HashMap::new(),
            }),
            room_topic: Mutex::new(()),
            appended,
        })
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn state(&self) -> RoomState {
        self.inner.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<RoomState> {
        self.inner.lock().state_tx.subscribe()
    }

    pub fn rooms(&self) -> Vec<ChatRoom> {
        self.inner.lock().rooms.clone()
    }

    pub fn room(&self, room_id: RoomId) -> Option<ChatRoom> {
        self.inner.lock().rooms.iter().find(|r| r.id == room_id).cloned()
    }

    /// The current (or last closed) room's messages in delivery order.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn cached_history(&self, room_id: RoomId) -> Option<Vec<Message>> {
        self.inner.lock().cache.get(&room_id).cloned()
    }

    /// Messages after `cursor`, and the cursor to pass next time. If the
    /// sequence was restarted since `cursor` was taken, everything is returned.
    pub fn messages_since(&self, cursor: Cursor) -> (Vec<Message>, Cursor) {
        let inner = self.inner.lock();
        let len = inner.messages.len();
        let start = if cursor.sequence == inner.sequence {
            cursor.offset.min(len)
        } else {
            0
        };
        let next = Cursor {
            sequence: inner.sequence,
            offset: len,
        };
        (inner.messages[start..].to_vec(), next)
    }

    /// Receive every message appended to a live room from now on.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Arc<RoomMessage>> {
        self.appended.subscribe()
    }

    /// Fetch the room list and keep one unread topic per listed room.
    pub async fn load_rooms(self: &Arc<Self>) -> Result<Vec<ChatRoom>> {
        let rooms = self.api.list_rooms().await?;
        let listed: HashSet<RoomId> = rooms.iter().map(|r| r.id).collect();
        self.inner.lock().rooms = rooms.clone();

        let removed = self.registry.retain(|key| {
            key.kind != TopicKind::ChatRoomUnread || listed.contains(&key.resource_id)
        });
        for room in &rooms {
            self.watch_room_unread(room.id)?;
        }
        tracing::debug!(rooms = rooms.len(), removed, "chat rooms loaded");
        Ok(rooms)
    }

    /// Select the room with `user_id`, creating it first if it does not exist.
    pub async fn open_with_user(self: &Arc<Self>, user_id: UserId) -> Result<RoomId> {
        let existing = self
            .inner
            .lock()
            .rooms
            .iter()
            .find(|r| r.counterpart.id == user_id)
            .map(|r| r.id);

        let room_id = match existing {
            Some(room_id) => room_id,
            None => {
                let room = self.api.create_room_with(user_id).await?;
                let room_id = room.id;
                {
                    let mut inner = self.inner.lock();
                    if inner.room_mut(room_id).is_none() {
                        inner.rooms.insert(0, room);
                    }
                }
                self.watch_room_unread(room_id)?;
                room_id
            }
        };
        self.select_room(room_id).await?;
        Ok(room_id)
    }

    /// Leave the active room (if any) and load `room_id`.
    ///
    /// Resolves once the room is LIVE, or immediately if it already is. If
    /// the same room is already loading, waits for that load instead of
    /// starting another. If the selection is superseded while history loads,
    /// the history is dropped and this still returns `Ok`.
    pub async fn select_room(self: &Arc<Self>, room_id: RoomId) -> Result<()> {
        let selection = {
            let _topic = self.room_topic.lock();
            let selection = {
                let mut inner = self.inner.lock();
                if inner.room_mut(room_id).is_none() {
                    return Err(RealtimeError::UnknownRoom(room_id));
                }
                match inner.state {
                    RoomState::Live { room_id: r } if r == room_id => Selection::Ready,
                    RoomState::LoadingHistory { room_id: r } if r == room_id => {
                        Selection::Await(inner.state_tx.subscribe())
                    }
                    _ => {
                        let previous = inner.close_active();
                        inner.epoch += 1;
                        inner.set_state(RoomState::LoadingHistory { room_id });
                        inner.pending.clear();
                        inner.reset_messages(Vec::new());
                        Selection::Begin {
                            epoch: inner.epoch,
                            previous,
                        }
                    }
                }
            };
            if let Selection::Begin { epoch, previous } = selection {
                if let Some(previous) = previous {
                    self.registry.deregister(&Topic::ChatRoom { room_id: previous }.key());
                }
                let topic = Topic::ChatRoom { room_id };
                // A registration left from an earlier selection carries a stale epoch.
                self.registry.deregister(&topic.key());
                if let Err(err) = self.registry.register_topic(topic, self.room_handler(room_id, epoch)) {
                    self.abandon_locked(room_id, epoch);
                    return Err(err);
                }
            }
            selection
        };

        let epoch = match selection {
            Selection::Ready => return Ok(()),
            Selection::Await(states) => return Self::await_load(room_id, states).await,
            Selection::Begin { epoch, .. } => epoch,
        };

        let history = self.api.room_messages(room_id).await;

        let fresh = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                let err = RealtimeError::StaleUpdate(format!("history of room {room_id}"));
                tracing::debug!(%err, "discarding history");
                return Ok(());
            }
            match history {
                Ok(history) => {
                    let pending = std::mem::take(&mut inner.pending);
                    let (merged, fresh) = merge(history, pending);
                    inner.reset_messages(merged);
                    inner.set_state(RoomState::Live { room_id });
                    tracing::debug!(room_id, messages = inner.messages.len(), "room live");
                    fresh
                }
                Err(err) => {
                    drop(inner);
                    self.abandon(room_id, epoch);
                    return Err(err);
                }
            }
        };
        for message in fresh {
            let _ = self.appended.send(Arc::new(RoomMessage { room_id, message }));
        }
        Ok(())
    }

    /// Wait for another caller's in-flight load of `room_id` to settle.
    async fn await_load(room_id: RoomId, mut states: watch::Receiver<RoomState>) -> Result<()> {
        let settled = states
            .wait_for(|s| *s != RoomState::LoadingHistory { room_id })
            .await
            .map(|s| *s)
            .map_err(|_| RealtimeError::NotConnected)?;
        match settled {
            // The load failed; its own caller got the error.
            RoomState::NoRoomSelected => Err(RealtimeError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Leave the active room. Returns whether one was active.
    pub fn leave(&self) -> bool {
        let _topic = self.room_topic.lock();
        let Some(room_id) = self.inner.lock().close_active() else {
            return false;
        };
        self.registry.deregister(&Topic::ChatRoom { room_id }.key());
        tracing::debug!(room_id, "room closed");
        true
    }

    /// Leave the active room and drop every room unread topic.
    pub fn detach(&self) {
        self.leave();
        self.registry
            .retain(|key| key.kind != TopicKind::ChatRoomUnread);
    }

    /// Publish `content` to the live room.
    ///
    /// The room's last-message snapshot is updated right away; the message
    /// itself appears in the sequence when the broker echoes it.
    pub fn send(&self, content: &str) -> Result<()> {
        let (room_id, outgoing) = self.prepare_send(content)?;
        self.registry
            .connection()
            .publish(&chat_send_destination(room_id), &outgoing)?;
        self.record_sent(room_id, outgoing.content);
        Ok(())
    }

    /// Like [`send`](Self::send), but waits for the broker's receipt.
    pub async fn send_confirmed(&self, content: &str) -> Result<()> {
        let (room_id, outgoing) = self.prepare_send(content)?;
        self.registry
            .connection()
            .publish_confirmed(&chat_send_destination(room_id), &outgoing)
            .await?;
        self.record_sent(room_id, outgoing.content);
        Ok(())
    }

    fn prepare_send(&self, content: &str) -> Result<(RoomId, OutgoingMessage)> {
        let mut inner = self.inner.lock();
        let RoomState::Live { room_id } = inner.state else {
            return Err(RealtimeError::NotConnected);
        };
        if content.trim().is_empty() {
            return Err(RealtimeError::EmptyMessage);
        }
        let recipient_id = inner
            .room_mut(room_id)
            .map(|r| r.counterpart.id)
            .ok_or(RealtimeError::UnknownRoom(room_id))?;
        Ok((
            room_id,
            OutgoingMessage {
                sender_id: self.viewer,
                recipient_id,
                content: content.to_string(),
            },
        ))
    }

    fn record_sent(&self, room_id: RoomId, content: String) {
        let viewer = self.viewer;
        if let Some(room) = self.inner.lock().room_mut(room_id) {
            room.last_message = Some(Message {
                sender_id: viewer,
                content,
                timestamp: Utc::now(),
            });
        }
    }

    fn abandon(&self, room_id: RoomId, epoch: u64) {
        let _topic = self.room_topic.lock();
        self.abandon_locked(room_id, epoch);
    }

    /// [`abandon`](Self::abandon) with `room_topic` already held.
    fn abandon_locked(&self, room_id: RoomId, epoch: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.epoch += 1;
            inner.pending.clear();
            inner.set_state(RoomState::NoRoomSelected);
        }
        self.registry.deregister(&Topic::ChatRoom { room_id }.key());
    }

    fn watch_room_unread(self: &Arc<Self>, room_id: RoomId) -> Result<SubscriptionHandle> {
        let topic = Topic::ChatRoomUnread {
            room_id,
            user_id: self.viewer,
        };
        let this: Weak<Self> = Arc::downgrade(self);
        let handler: Handler = Arc::new(move |delivery: Delivery| {
            if let Some(this) = this.upgrade() {
                this.on_room_unread(room_id, delivery);
            }
        });
        self.registry.register_topic(topic, handler)
    }

    fn on_room_unread(&self, room_id: RoomId, delivery: Delivery) {
        let update: RoomUnreadUpdate = match delivery.json() {
            Ok(update) => update,
            Err(err) => {
                tracing::warn!(%err, room_id, "bad room unread payload");
                return;
            }
        };
        match self.inner.lock().room_mut(room_id) {
            Some(room) => room.apply(update),
            None => tracing::debug!(room_id, "unread update for unlisted room"),
        }
    }

    fn room_handler(self: &Arc<Self>, room_id: RoomId, epoch: u64) -> Handler {
        let this: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |delivery: Delivery| {
            let Some(this) = this.upgrade() else {
                return;
            };
            match delivery.json::<MessageDto>() {
                Ok(dto) => this.on_room_message(room_id, epoch, dto.into()),
                Err(err) => tracing::warn!(%err, room_id, "bad chat message payload"),
            }
        })
    }

    fn on_room_message(&self, room_id: RoomId, epoch: u64, message: Message) {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                let err = RealtimeError::StaleUpdate(format!("message for room {room_id}"));
                tracing::debug!(%err, "discarding delivery");
                return;
            }
            let state = inner.state;
            match state {
                RoomState::LoadingHistory { room_id: r } if r == room_id => {
                    inner.pending.push(message);
                    return;
                }
                RoomState::Live { room_id: r } if r == room_id => {
                    inner.messages.push(message.clone());
                    if let Some(room) = inner.room_mut(room_id) {
                        room.last_message = Some(message.clone());
                    }
                }
                _ => return,
            }
        }
        let _ = self.appended.send(Arc::new(RoomMessage { room_id, message }));
    }
}

/// Append buffered live messages to history, skipping ones history already
/// has. Returns the merged sequence and the messages that were new.
fn merge(mut history: Vec<Message>, pending: Vec<Message>) -> (Vec<Message>, Vec<Message>) {
    let fresh: Vec<Message> = {
        let seen: HashSet<&Message> = history.iter().collect();
        pending.into_iter().filter(|m| !seen.contains(m)).collect()
    };
    history.extend(fresh.iter().cloned());
    (history, fresh)
}
