#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::time;

use fitra_realtime::bus::frame::{Command, Frame, Header};
use fitra_realtime::bus::transport::{Connector, Link};
use fitra_realtime::chat::models::UserRef;
use fitra_realtime::chat::{ChatApi, ChatRoom, Message};
use fitra_realtime::config::{BackoffPolicy, Config};
use fitra_realtime::error::{RealtimeError, Result};
use fitra_realtime::RealtimeSession;

pub const TOKEN: &str = "test-token";
pub const VIEWER: i64 = 7;

// ---------------------------------------------------------------------------
// In-memory STOMP broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    /// Every frame any client link sent, in order.
    received: Vec<Frame>,
    /// Subscription id -> destination, for the current link only.
    subscriptions: HashMap<String, String>,
    /// (link number, sender to the client) of the current link.
    link: Option<(u64, mpsc::UnboundedSender<String>)>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    links: AtomicU64,
    messages: AtomicU64,
    refuse: AtomicBool,
    reject: AtomicBool,
    hold_receipts: AtomicBool,
}

/// A broker that lives in the test process and speaks enough STOMP for the
/// client: CONNECT/CONNECTED/ERROR, SUBSCRIBE, UNSUBSCRIBE, SEND with
/// receipts, and MESSAGE pushes on demand.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Make `open` fail as if the network were down.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Answer CONNECT with an ERROR frame.
    pub fn reject_credentials(&self, reject: bool) {
        self.shared.reject.store(reject, Ordering::SeqCst);
    }

    pub fn hold_receipts(&self, hold: bool) {
        self.shared.hold_receipts.store(hold, Ordering::SeqCst);
    }

    /// Links opened so far.
    pub fn opens(&self) -> u64 {
        self.shared.links.load(Ordering::SeqCst)
    }

    /// Drop the current link from the broker side.
    pub fn kill_link(&self) {
        let mut state = self.shared.state.lock();
        state.link = None;
        state.subscriptions.clear();
    }

    /// Deliver `body` to every subscription on `destination`. Returns how many
    /// subscriptions received it.
    pub fn push(&self, destination: &str, body: Value) -> usize {
        let state = self.shared.state.lock();
        let Some((_, tx)) = state.link.as_ref() else {
            return 0;
        };
        let mut delivered = 0;
        for (id, dest) in &state.subscriptions {
            if dest != destination {
                continue;
            }
            let n = self.shared.messages.fetch_add(1, Ordering::SeqCst);
            let frame = Frame::new(Command::Message)
                .header(Header::SUBSCRIPTION, id.as_str())
                .header(Header::DESTINATION, destination)
                .header("message-id", n.to_string())
                .with_body("application/json", body.to_string());
            if tx.send(frame.encode()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Live subscriptions on `destination` for the current link.
    pub fn subscribers(&self, destination: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .values()
            .filter(|d| *d == destination)
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.state.lock().subscriptions.len()
    }

    pub fn frames(&self, command: Command) -> Vec<Frame> {
        self.shared
            .state
            .lock()
            .received
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }

    /// JSON bodies of every SEND to `destination`.
    pub fn sent_to(&self, destination: &str) -> Vec<Value> {
        self.frames(Command::Send)
            .into_iter()
            .filter(|f| f.get(Header::DESTINATION) == Some(destination))
            .filter_map(|f| serde_json::from_str(&f.body).ok())
            .collect()
    }

    pub fn clear_frames(&self) {
        self.shared.state.lock().received.clear();
    }

    fn handle(&self, link: u64, frame: Frame) {
        let mut state = self.shared.state.lock();
        state.received.push(frame.clone());
        let current = matches!(state.link, Some((n, _)) if n == link);
        if !current {
            return;
        }

        let reply = match frame.command {
            Command::Connect => {
                if self.shared.reject.load(Ordering::SeqCst) {
                    Some(
                        Frame::new(Command::Error)
                            .header(Header::MESSAGE, "invalid token")
                            .with_body("text/plain", "bearer token rejected"),
                    )
                } else {
                    Some(
                        Frame::new(Command::Connected)
                            .header(Header::VERSION, "1.2")
                            .header(Header::SESSION, format!("mem-{link}"))
                            .header("server", "memory-broker"),
                    )
                }
            }
            Command::Subscribe => {
                if let (Some(id), Some(dest)) = (frame.get(Header::ID), frame.get(Header::DESTINATION)) {
                    state.subscriptions.insert(id.to_string(), dest.to_string());
                }
                None
            }
            Command::Unsubscribe => {
                if let Some(id) = frame.get(Header::ID) {
                    state.subscriptions.remove(id);
                }
                None
            }
            Command::Send => frame
                .get(Header::RECEIPT)
                .filter(|_| !self.shared.hold_receipts.load(Ordering::SeqCst))
                .map(|id| Frame::new(Command::Receipt).header(Header::RECEIPT_ID, id)),
            _ => None,
        };

        if let (Some(reply), Some((_, tx))) = (reply, state.link.as_ref()) {
            let _ = tx.send(reply.encode());
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self) -> Result<Link> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(RealtimeError::transport("connection refused"));
        }
        let link = self.shared.links.fetch_add(1, Ordering::SeqCst) + 1;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        {
            let mut state = self.shared.state.lock();
            state.link = Some((link, in_tx));
            state.subscriptions.clear();
        }

        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                match Frame::decode_all(&text) {
                    Ok(frames) => frames.into_iter().for_each(|f| broker.handle(link, f)),
                    Err(err) => panic!("client sent a malformed frame: {err}"),
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn host(&self) -> String {
        "memory".into()
    }
}

// ---------------------------------------------------------------------------
// Fake chat REST API
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeChatApi {
    rooms: Mutex<Vec<ChatRoom>>,
    history: Mutex<HashMap<i64, Vec<Message>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_history: AtomicBool,
    next_room: AtomicI64,
    pub history_calls: AtomicUsize,
    pub created_with: Mutex<Vec<i64>>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_room: AtomicI64::new(1000),
            ..Default::default()
        })
    }

    pub fn set_rooms(&self, rooms: Vec<ChatRoom>) {
        *self.rooms.lock() = rooms;
    }

    pub fn set_history(&self, room_id: i64, messages: Vec<Message>) {
        self.history.lock().insert(room_id, messages);
    }

    pub fn append_history(&self, room_id: i64, message: Message) {
        self.history.lock().entry(room_id).or_default().push(message);
    }

    /// Hold every history fetch until [`release_history`](Self::release_history).
    pub fn hold_history(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one held history fetch complete.
    pub fn release_history(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_rooms(&self) -> Result<Vec<ChatRoom>> {
        Ok(self.rooms.lock().clone())
    }

    async fn room_messages(&self, room_id: i64) -> Result<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(RealtimeError::Http("500 Internal Server Error".into()));
        }
        Ok(self.history.lock().get(&room_id).cloned().unwrap_or_default())
    }

    async fn create_room_with(&self, user_id: i64) -> Result<ChatRoom> {
        self.created_with.lock().push(user_id);
        let room = chat_room(self.next_room.fetch_add(1, Ordering::SeqCst), user_id, None);
        self.rooms.lock().insert(0, room.clone());
        Ok(room)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn message(sender_id: i64, content: &str, second: u32) -> Message {
    Message {
        sender_id,
        content: content.into(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap(),
    }
}

/// Wire JSON of a chat message, as the broker pushes it on `/chat-room/{id}`.
pub fn message_json(m: &Message) -> Value {
    serde_json::json!({
        "sender": { "id": m.sender_id },
        "content": m.content,
        "timestamp": m.timestamp.to_rfc3339(),
    })
}

pub fn chat_room(id: i64, counterpart: i64, last: Option<Message>) -> ChatRoom {
    ChatRoom {
        id,
        counterpart: UserRef {
            id: counterpart,
            name: Some(format!("user {counterpart}")),
        },
        last_message: last,
        unread: false,
    }
}

pub fn test_config() -> Config {
    Config {
        bus_url: "ws://memory/chat-ws/websocket".into(),
        api_url: "http://memory/api".into(),
        auth_token: TOKEN.into(),
        user_id: VIEWER,
        connect_timeout: Duration::from_millis(500),
        receipt_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            max_attempts: 3,
        },
    }
}

pub async fn login(broker: &MemoryBroker, api: Arc<FakeChatApi>) -> RealtimeSession {
    RealtimeSession::login(test_config(), broker.connector(), api)
        .await
        .expect("login")
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        time::sleep(Duration::from_millis(5)).await;
    }
}
