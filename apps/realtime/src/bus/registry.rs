//! Keyed subscription registry.
//!
//! Views never subscribe on the connection directly; they register a key.
//! Registering a key that is already live is a no-op, so remounting a view
//! cannot stack duplicate subscriptions. The registry is also the source of
//! truth the reconnect supervisor replays after a transport failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::connection::{Handler, SubscriptionHandle, TopicConnection};
use super::topics::{SubscriptionKey, Topic};
use crate::error::{RealtimeError, Result};

struct Registration {
    topic: Topic,
    /// Liveness-guarded handler, reused verbatim on resubscribe.
    handler: Handler,
    handle: SubscriptionHandle,
    live: Arc<AtomicBool>,
}

/// Counts from one [`SubscriptionRegistry::resubscribe_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResubscribeReport {
    pub subscriptions: usize,
    pub probes: usize,
}

pub struct SubscriptionRegistry {
    connection: Arc<TopicConnection>,
    entries: DashMap<SubscriptionKey, Registration>,
}

impl SubscriptionRegistry {
    pub fn new(connection: Arc<TopicConnection>) -> Self {
        Self {
            connection,
            entries: DashMap::new(),
        }
    }

    pub fn connection(&self) -> &Arc<TopicConnection> {
        &self.connection
    }

    /// Subscribe `handler` to `topic` under `key`.
    ///
    /// If `key` is already registered the existing handle is returned and
    /// nothing is sent. A fresh registration publishes the topic's probe.
    pub fn register(
        &self,
        key: SubscriptionKey,
        topic: Topic,
        handler: Handler,
    ) -> Result<SubscriptionHandle> {
        let handle = match self.entries.entry(key) {
            Entry::Occupied(existing) => {
                tracing::trace!(%key, "already registered");
                return Ok(existing.get().handle.clone());
            }
            Entry::Vacant(slot) => {
                let live = Arc::new(AtomicBool::new(true));
                let handler = guard(key, live.clone(), handler);
                let handle = self
                    .connection
                    .subscribe(&topic.destination(), handler.clone())?;
                slot.insert(Registration {
                    topic,
                    handler,
                    handle: handle.clone(),
                    live,
                });
                handle
            }
        };

        tracing::debug!(%key, %topic, "registered");
        self.send_probe(&topic);
        Ok(handle)
    }

    /// [`register`](Self::register) keyed by the topic's own identity.
    pub fn register_topic(&self, topic: Topic, handler: Handler) -> Result<SubscriptionHandle> {
        self.register(topic.key(), topic, handler)
    }

    /// Register several subscriptions, stopping at the first failure.
    pub fn register_many<I>(&self, items: I) -> Result<Vec<SubscriptionHandle>>
    where
        I: IntoIterator<Item = (SubscriptionKey, Topic, Handler)>,
    {
        items
            .into_iter()
            .map(|(key, topic, handler)| self.register(key, topic, handler))
            .collect()
    }

    /// Unsubscribe and forget `key`. Returns whether it was registered.
    ///
    /// After this returns the handler is not invoked again, even for a
    /// delivery already in flight.
    pub fn deregister(&self, key: &SubscriptionKey) -> bool {
        let Some((_, registration)) = self.entries.remove(key) else {
            return false;
        };
        registration.live.store(false, Ordering::Release);
        self.connection.unsubscribe(&registration.handle);
        tracing::debug!(%key, "deregistered");
        true
    }

    /// Deregister everything (logout). Returns how many keys were removed.
    pub fn deregister_all(&self) -> usize {
        self.retain(|_| false)
    }

    /// Deregister every key `keep` rejects. Returns how many were removed.
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&SubscriptionKey) -> bool,
    {
        let doomed: Vec<SubscriptionKey> = self
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|key| !keep(key))
            .collect();
        doomed.iter().filter(|key| self.deregister(key)).count()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn handle(&self, key: &SubscriptionKey) -> Option<SubscriptionHandle> {
        self.entries.get(key).map(|e| e.handle.clone())
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-issue every registered subscription on the current link and send
    /// each probe once. Used after a reconnect; keys and handlers are kept.
    ///
    /// Entries already subscribed on the current link (registered after the
    /// reconnect but before the replay) are counted but not subscribed again.
    pub fn resubscribe_all(&self) -> Result<ResubscribeReport> {
        let mut report = ResubscribeReport::default();
        for key in self.keys() {
            let topic = {
                let Some(mut registration) = self.entries.get_mut(&key) else {
                    continue;
                };
                if self.connection.is_current(&registration.handle) {
                    tracing::trace!(%key, "already on the current link");
                    report.subscriptions += 1;
                    continue;
                }
                let handle = self
                    .connection
                    .subscribe(&registration.topic.destination(), registration.handler.clone())?;
                registration.handle = handle;
                registration.topic
            };
            report.subscriptions += 1;
            if self.send_probe(&topic) {
                report.probes += 1;
            }
        }
        tracing::info!(
            subscriptions = report.subscriptions,
            probes = report.probes,
            "subscriptions replayed"
        );
        Ok(report)
    }

    fn send_probe(&self, topic: &Topic) -> bool {
        let Some(probe) = topic.probe() else {
            return false;
        };
        match self.connection.publish(&probe.destination, &probe.payload) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, destination = %probe.destination, "probe not sent");
                false
            }
        }
    }
}

fn guard(key: SubscriptionKey, live: Arc<AtomicBool>, handler: Handler) -> Handler {
    Arc::new(move |delivery| {
        if live.load(Ordering::Acquire) {
            handler(delivery);
        } else {
            let err = RealtimeError::StaleUpdate(key.to_string());
            tracing::debug!(%err, "discarding delivery");
        }
    })
}
