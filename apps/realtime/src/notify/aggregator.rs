//! Badge aggregation over independent unread-count streams.
//!
//! Every source's count is authoritative from the broker: an update replaces
//! the entry for that source and the total is recomputed from the map. No
//! count is ever incremented locally or derived from another source.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::bus::connection::{Delivery, Handler, SubscriptionHandle, TopicConnection};
use crate::bus::registry::SubscriptionRegistry;
use crate::bus::topics::{Source, Topic, TopicKind, TravelId, UserId};
use crate::error::{RealtimeError, Result};

/// Latest count per source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounters {
    counts: BTreeMap<Source, u64>,
}

impl UnreadCounters {
    pub fn get(&self, source: Source) -> u64 {
        self.counts.get(&source).copied().unwrap_or(0)
    }

    /// Replace the entry for `source`, returning the previous value if any.
    pub fn set(&mut self, source: Source, count: u64) -> Option<u64> {
        self.counts.insert(source, count)
    }

    /// Sum of every source, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Source, u64)> + '_ {
        self.counts.iter().map(|(s, c)| (*s, *c))
    }
}

/// What the navigation badge renders from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadgeSnapshot {
    pub counters: UnreadCounters,
    pub total: u64,
}

pub struct NotificationAggregator {
    connection: Arc<TopicConnection>,
    counters: Mutex<UnreadCounters>,
    /// Unread join requests per created travel. Not part of the badge total.
    travel_requests: DashMap<TravelId, u64>,
    badge: watch::Sender<BadgeSnapshot>,
}

impl NotificationAggregator {
    pub fn new(connection: Arc<TopicConnection>) -> Arc<Self> {
        let (badge, _) = watch::channel(BadgeSnapshot::default());
        Arc::new(Self {
            connection,
            counters: Mutex::new(UnreadCounters::default()),
            travel_requests: DashMap::new(),
            badge,
        })
    }

    /// Replace the count for `source` and return the new badge total.
    pub fn on_source_update(&self, source: Source, new_count: u64) -> u64 {
        let mut counters = self.counters.lock();
        let previous = counters.set(source, new_count);
        let total = counters.total();
        self.badge.send_replace(BadgeSnapshot {
            counters: counters.clone(),
            total,
        });
        tracing::debug!(%source, new_count, ?previous, total, "unread count updated");
        total
    }

    /// Publish the zero probe for `source`, telling the broker the viewer has
    /// seen it. `resource_id` is the viewer id for user-level sources.
    ///
    /// The local count is left alone; the broker answers with the fresh value.
    pub fn announce_viewed(&self, source: Source, resource_id: i64) -> Result<()> {
        self.publish_probe(&source.topic(resource_id))
    }

    /// Publish the zero probe for one travel's join-request counter.
    pub fn announce_travel_viewed(&self, travel_id: TravelId) -> Result<()> {
        self.publish_probe(&Topic::TravelRequests { travel_id })
    }

    fn publish_probe(&self, topic: &Topic) -> Result<()> {
        let probe = topic
            .probe()
            .ok_or_else(|| RealtimeError::Payload(format!("{topic} has no probe")))?;
        self.connection.publish(&probe.destination, &probe.payload)
    }

    pub fn total(&self) -> u64 {
        self.counters.lock().total()
    }

    pub fn count(&self, source: Source) -> u64 {
        self.counters.lock().get(source)
    }

    pub fn snapshot(&self) -> UnreadCounters {
        self.counters.lock().clone()
    }

    pub fn watch(&self) -> watch::Receiver<BadgeSnapshot> {
        self.badge.subscribe()
    }

    pub fn on_travel_update(&self, travel_id: TravelId, count: u64) {
        self.travel_requests.insert(travel_id, count);
        tracing::debug!(travel_id, count, "travel join requests updated");
    }

    pub fn travel_request_count(&self, travel_id: TravelId) -> Option<u64> {
        self.travel_requests.get(&travel_id).map(|c| *c)
    }

    /// Register the three user-level counter topics for `viewer`.
    pub fn attach(
        self: &Arc<Self>,
        registry: &SubscriptionRegistry,
        viewer: UserId,
    ) -> Result<Vec<SubscriptionHandle>> {
        registry.register_many(Source::ALL.into_iter().map(|source| {
            let topic = source.topic(viewer);
            (topic.key(), topic, self.source_handler(source))
        }))
    }

    /// Keep per-travel counters subscribed for exactly `travel_ids`.
    ///
    /// Travels that left the set are deregistered and their counts dropped.
    /// Returns the number of travels now watched.
    pub fn watch_travel_requests(
        self: &Arc<Self>,
        registry: &SubscriptionRegistry,
        travel_ids: &[TravelId],
    ) -> Result<usize> {
        let wanted: HashSet<TravelId> = travel_ids.iter().copied().collect();
        let removed = registry.retain(|key| {
            key.kind != TopicKind::TravelRequests || wanted.contains(&key.resource_id)
        });
        self.travel_requests.retain(|id, _| wanted.contains(id));

        for &travel_id in &wanted {
            registry.register_topic(
                Topic::TravelRequests { travel_id },
                self.travel_handler(travel_id),
            )?;
        }
        tracing::debug!(watched = wanted.len(), removed, "travel counters reconciled");
        Ok(wanted.len())
    }

    /// Forget all counts (logout).
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        *counters = UnreadCounters::default();
        self.travel_requests.clear();
        self.badge.send_replace(BadgeSnapshot::default());
    }

    fn source_handler(self: &Arc<Self>, source: Source) -> Handler {
        let this: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |delivery: Delivery| {
            let Some(this) = this.upgrade() else {
                return;
            };
            match parse_count(&delivery, source.count_field()) {
                Ok(count) => {
                    this.on_source_update(source, count);
                }
                Err(err) => {
                    tracing::warn!(%err, %source, destination = %delivery.destination, "bad counter payload")
                }
            }
        })
    }

    fn travel_handler(self: &Arc<Self>, travel_id: TravelId) -> Handler {
        let this: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |delivery: Delivery| {
            let Some(this) = this.upgrade() else {
                return;
            };
            match parse_count(&delivery, Source::JoinRequests.count_field()) {
                Ok(count) => this.on_travel_update(travel_id, count),
                Err(err) => tracing::warn!(%err, travel_id, "bad travel counter payload"),
            }
        })
    }
}

/// Read `{"<field>": n}` (or a bare `{"count": n}`) as a non-negative count.
fn parse_count(delivery: &Delivery, field: &str) -> Result<u64> {
    let body: Value = delivery.json()?;
    let raw = body
        .get(field)
        .or_else(|| body.get("count"))
        .ok_or_else(|| RealtimeError::Payload(format!("missing {field}")))?;
    raw.as_u64()
        .ok_or_else(|| RealtimeError::Payload(format!("{field} is not a count: {raw}")))
}
