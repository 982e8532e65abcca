//! Change notification fan-out for quotes and margin settings.
//!
//! Publishing never blocks. Each subscriber de-duplicates on its own side: an
//! event is delivered only if its timestamp is strictly newer than the last
//! one that subscriber accepted for the same key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::market_data::{CurrencyPair, MarginSettings, Quote, SourceId};

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Quote(SourceId, CurrencyPair),
    MarginSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    QuoteUpdated {
        source: SourceId,
        pair: CurrencyPair,
        quote: Quote,
        /// Writer that produced the event.
        origin: Uuid,
    },
    MarginSettingsUpdated {
        settings: MarginSettings,
        origin: Uuid,
    },
}

impl ChangeEvent {
    pub fn quote_updated(quote: Quote, origin: Uuid) -> Self {
        Self::QuoteUpdated {
            source: quote.source,
            pair: quote.pair.clone(),
            quote,
            origin,
        }
    }

    pub fn margin_settings_updated(settings: MarginSettings, origin: Uuid) -> Self {
        Self::MarginSettingsUpdated { settings, origin }
    }

    pub fn key(&self) -> EventKey {
        match self {
            Self::QuoteUpdated { source, pair, .. } => EventKey::Quote(*source, pair.clone()),
            Self::MarginSettingsUpdated { .. } => EventKey::MarginSettings,
        }
    }

    /// When the underlying value was written.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::QuoteUpdated { quote, .. } => quote.fetched_at,
            Self::MarginSettingsUpdated { settings, .. } => settings.updated_at,
        }
    }

    pub fn origin(&self) -> Uuid {
        match self {
            Self::QuoteUpdated { origin, .. } | Self::MarginSettingsUpdated { origin, .. } => {
                *origin
            }
        }
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event reached. With none, the event
    /// is dropped.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            rx: self.tx.subscribe(),
            last_seen: HashMap::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

pub struct ChangeSubscription {
    rx: broadcast::Receiver<ChangeEvent>,
    last_seen: HashMap<EventKey, DateTime<Utc>>,
}

impl ChangeSubscription {
    /// Next event newer than anything already delivered for its key, or
    /// `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.accept(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged; events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, event: &ChangeEvent) -> bool {
        let at = event.timestamp();
        match self.last_seen.get(&event.key()) {
            Some(seen) if at <= *seen => false,
            _ => {
                self.last_seen.insert(event.key(), at);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Provenance;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn quote(second: u32, buy: Decimal) -> Quote {
        Quote {
            source: SourceId::P2pExchange,
            pair: CurrencyPair::new("USDT", "NGN"),
            buy,
            sell: dec!(0),
            fetched_at: Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, second).unwrap(),
            provenance: Provenance::Live,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = ChangeBus::new(4);
        assert_eq!(
            bus.publish(ChangeEvent::quote_updated(quote(0, dec!(1)), Uuid::nil())),
            0
        );
    }

    #[tokio::test]
    async fn same_or_older_timestamps_are_not_redelivered() {
        let bus = ChangeBus::new(16);
        let mut sub = bus.subscribe();
        let origin = Uuid::new_v4();

        bus.publish(ChangeEvent::quote_updated(quote(5, dec!(1500)), origin));
        bus.publish(ChangeEvent::quote_updated(quote(5, dec!(1501)), origin));
        bus.publish(ChangeEvent::quote_updated(quote(3, dec!(1499)), origin));
        bus.publish(ChangeEvent::quote_updated(quote(6, dec!(1502)), origin));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first, second) {
            (
                ChangeEvent::QuoteUpdated { quote: a, .. },
                ChangeEvent::QuoteUpdated { quote: b, .. },
            ) => {
                assert_eq!(a.buy, dec!(1500));
                assert_eq!(b.buy, dec!(1502));
            }
            other => panic!("unexpected events: {other:?}"),
        }

        let nothing = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn keys_are_deduplicated_independently() {
        let bus = ChangeBus::new(16);
        let mut sub = bus.subscribe();
        let origin = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 5).unwrap();

        bus.publish(ChangeEvent::quote_updated(quote(5, dec!(1500)), origin));
        bus.publish(ChangeEvent::margin_settings_updated(
            MarginSettings::new(dec!(2), dec!(3), at),
            origin,
        ));

        assert!(matches!(
            sub.recv().await,
            Some(ChangeEvent::QuoteUpdated { .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(ChangeEvent::MarginSettingsUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn lagging_subscriber_continues_with_newest() {
        let bus = ChangeBus::new(2);
        let mut sub = bus.subscribe();
        for second in 0..6 {
            bus.publish(ChangeEvent::quote_updated(
                quote(second, Decimal::from(second)),
                Uuid::nil(),
            ));
        }
        let event = sub.recv().await.unwrap();
        assert_eq!(event.timestamp().format("%S").to_string(), "04");
    }

    #[tokio::test]
    async fn recv_ends_when_bus_is_dropped() {
        let bus = ChangeBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
