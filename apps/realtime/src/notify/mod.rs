pub mod aggregator;

pub use aggregator::{BadgeSnapshot, NotificationAggregator, UnreadCounters};
