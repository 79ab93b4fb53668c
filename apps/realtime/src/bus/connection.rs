//! The single broker connection of a session.
//!
//! Every topic operation is multiplexed over one [`Link`]. A reader task owns
//! the inbound side and routes MESSAGE frames to subscription handlers by
//! subscription id. When the link dies the state moves to
//! [`ConnectionState::Failed`], which the reconnect supervisor watches.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use fitra_common::id::{prefix, prefixed_ulid};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::frame::{Command, Frame, Header};
use super::transport::{Connector, Link};
use crate::error::{RealtimeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: String,
    pub subscription: String,
    pub body: String,
}

impl Delivery {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Returned by a successful handshake.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub session_id: String,
    pub server: Option<String>,
    pub version: Option<String>,
}

/// Identifies one broker-side subscription on one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub destination: String,
    generation: u64,
}

struct Route {
    destination: String,
    handler: Handler,
}

struct LiveLink {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    generation: u64,
}

impl LiveLink {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.outbound
            .send(frame.encode())
            .map_err(|_| RealtimeError::transport("link closed"))
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct TopicConnection {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    receipt_timeout: Duration,
    credential: Mutex<Option<String>>,
    link: Mutex<Option<LiveLink>>,
    generation: AtomicU64,
    routes: DashMap<String, Route>,
    receipts: DashMap<String, oneshot::Sender<()>>,
    state: watch::Sender<ConnectionState>,
}

impl TopicConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        receipt_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            connect_timeout,
            receipt_timeout,
            credential: Mutex::new(None),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            routes: DashMap::new(),
            receipts: DashMap::new(),
            state,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of broker subscriptions routed on the current link.
    pub fn active_subscriptions(&self) -> usize {
        self.routes.len()
    }

    /// Open the link and perform the STOMP handshake with `credential`.
    ///
    /// The credential is kept for [`reconnect`](Self::reconnect) until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<ConnectionHandle> {
        *self.credential.lock() = Some(credential.to_string());
        self.establish(credential).await
    }

    /// Repeat the handshake with the stored credential on a fresh link.
    ///
    /// Routes from the previous link are dropped; callers re-subscribe.
    pub async fn reconnect(self: &Arc<Self>) -> Result<ConnectionHandle> {
        let credential = self
            .credential
            .lock()
            .clone()
            .ok_or_else(|| RealtimeError::auth("no credential; session was logged out"))?;
        self.establish(&credential).await
    }

    async fn establish(self: &Arc<Self>, credential: &str) -> Result<ConnectionHandle> {
        drop(self.link.lock().take());
        self.routes.clear();
        self.receipts.clear();
        self.state.send_replace(ConnectionState::Connecting);

        match self.handshake(credential).await {
            Ok((link, handle)) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                // Hold the slot while spawning so an instantly dead link is still
                // seen as current by `link_lost`.
                let mut slot = self.link.lock();
                let reader = tokio::spawn(read_loop(Arc::downgrade(self), link.inbound, generation));
                *slot = Some(LiveLink {
                    outbound: link.outbound,
                    reader,
                    generation,
                });
                self.state.send_replace(ConnectionState::Connected);
                drop(slot);
                tracing::info!(
                    session_id = %handle.session_id,
                    version = ?handle.version,
                    "bus connected"
                );
                Ok(handle)
            }
            Err(err) => {
                let next = if err.is_retryable() {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Disconnected
                };
                tracing::warn!(%err, ?next, "bus handshake failed");
                self.state.send_replace(next);
                Err(err)
            }
        }
    }

    async fn handshake(&self, credential: &str) -> Result<(Link, ConnectionHandle)> {
        let mut link = self.connector.open().await?;
        link.outbound
            .send(Frame::connect(&self.connector.host(), credential).encode())
            .map_err(|_| RealtimeError::transport("link closed during handshake"))?;

        let reply = time::timeout(self.connect_timeout, first_frame(&mut link.inbound))
            .await
            .map_err(|_| RealtimeError::transport("handshake timed out"))??;

        match reply.command {
            Command::Connected => {
                let handle = ConnectionHandle {
                    session_id: reply
                        .get(Header::SESSION)
                        .map(str::to_string)
                        .unwrap_or_else(|| prefixed_ulid(prefix::SESSION)),
                    server: reply.get("server").map(str::to_string),
                    version: reply.get(Header::VERSION).map(str::to_string),
                };
                Ok((link, handle))
            }
            Command::Error => {
                let reason = reply
                    .get(Header::MESSAGE)
                    .map(str::to_string)
                    .unwrap_or_else(|| reply.body.clone());
                Err(RealtimeError::Auth(reason))
            }
            other => Err(RealtimeError::transport(format!(
                "unexpected {other} during handshake"
            ))),
        }
    }

    /// Subscribe `handler` to `destination` on the current link.
    pub fn subscribe(&self, destination: &str, handler: Handler) -> Result<SubscriptionHandle> {
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(RealtimeError::NotConnected)?;

        let id = prefixed_ulid(prefix::SUBSCRIPTION);
        // Route first so nothing delivered right after SUBSCRIBE is dropped.
        self.routes.insert(
            id.clone(),
            Route {
                destination: destination.to_string(),
                handler,
            },
        );
        if let Err(err) = link.send(&Frame::subscribe(&id, destination)) {
            self.routes.remove(&id);
            return Err(err);
        }

        tracing::debug!(%destination, subscription = %id, "subscribed");
        Ok(SubscriptionHandle {
            id,
            destination: destination.to_string(),
            generation: link.generation,
        })
    }

    /// Whether `handle` was issued on the link that is live right now.
    pub fn is_current(&self, handle: &SubscriptionHandle) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|l| l.generation == handle.generation)
            && self.routes.contains_key(&handle.id)
    }

    /// Stop routing deliveries for `handle`. Never fails; a handle from an
    /// earlier link only loses its (already dead) route.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.routes.remove(&handle.id);
        let guard = self.link.lock();
        if let Some(link) = guard.as_ref().filter(|l| l.generation == handle.generation) {
            if link.send(&Frame::unsubscribe(&handle.id)).is_err() {
                tracing::debug!(subscription = %handle.id, "unsubscribe not sent; link closed");
            }
        }
    }

    /// Fire-and-forget JSON publish.
    pub fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(RealtimeError::NotConnected)?;
        link.send(&Frame::send(destination, body))
    }

    /// Publish and wait for the broker's RECEIPT.
    pub async fn publish_confirmed<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let receipt_id = prefixed_ulid(prefix::RECEIPT);
        let (tx, rx) = oneshot::channel();
        {
            let guard = self.link.lock();
            let link = guard.as_ref().ok_or(RealtimeError::NotConnected)?;
            self.receipts.insert(receipt_id.clone(), tx);
            let frame = Frame::send(destination, body).header(Header::RECEIPT, receipt_id.as_str());
            if let Err(err) = link.send(&frame) {
                self.receipts.remove(&receipt_id);
                return Err(err);
            }
        }

        match time::timeout(self.receipt_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RealtimeError::transport("link lost before receipt")),
            Err(_) => {
                self.receipts.remove(&receipt_id);
                Err(RealtimeError::ReceiptTimeout(receipt_id))
            }
        }
    }

    /// Close the link and forget the credential. Idempotent.
    pub fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            let _ = link.send(&Frame::disconnect());
            drop(link);
            tracing::info!("bus disconnected");
        }
        self.routes.clear();
        self.receipts.clear();
        *self.credential.lock() = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let Some(subscription) = frame.get(Header::SUBSCRIPTION).map(str::to_string) else {
                    tracing::debug!("MESSAGE without subscription header");
                    return;
                };
                let route = self
                    .routes
                    .get(&subscription)
                    .map(|r| (r.handler.clone(), r.destination.clone()));
                let Some((handler, destination)) = route else {
                    tracing::debug!(%subscription, "delivery for unknown subscription dropped");
                    return;
                };
                let delivery = Delivery {
                    destination,
                    subscription: subscription.clone(),
                    body: frame.body,
                };
                // A panicking handler must not take the reader task down with it.
                if panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
                    tracing::error!(%subscription, "subscription handler panicked");
                }
            }
            Command::Receipt => {
                if let Some((_, tx)) = frame
                    .get(Header::RECEIPT_ID)
                    .and_then(|id| self.receipts.remove(id))
                {
                    let _ = tx.send(());
                }
            }
            Command::Error => {
                tracing::warn!(
                    message = frame.get(Header::MESSAGE).unwrap_or_default(),
                    body = %frame.body,
                    "broker error frame"
                );
            }
            other => tracing::debug!(command = %other, "ignoring frame"),
        }
    }

    fn link_lost(&self, generation: u64) {
        let lost = {
            let mut guard = self.link.lock();
            if guard.as_ref().map(|l| l.generation) == Some(generation) {
                guard.take()
            } else {
                None
            }
        };
        if lost.is_some() {
            self.routes.clear();
            self.receipts.clear();
            self.state.send_replace(ConnectionState::Failed);
            tracing::warn!(generation, "bus link lost");
        }
    }
}

async fn first_frame(inbound: &mut mpsc::UnboundedReceiver<String>) -> Result<Frame> {
    while let Some(text) = inbound.recv().await {
        if let Some(frame) = Frame::decode_all(&text)?.into_iter().next() {
            return Ok(frame);
        }
    }
    Err(RealtimeError::transport("link closed during handshake"))
}

async fn read_loop(
    conn: Weak<TopicConnection>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(text) = inbound.recv().await {
        let Some(strong) = conn.upgrade() else {
            return;
        };
        match Frame::decode_all(&text) {
            Ok(frames) => {
                for frame in frames {
                    strong.dispatch(frame);
                }
            }
            Err(err) => tracing::warn!(%err, "dropping malformed frame"),
        }
    }
    if let Some(conn) = conn.upgrade() {
        conn.link_lost(generation);
    }
}
