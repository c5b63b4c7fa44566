//! Relay collaborator interface
//!
//! Relays are the transport: append-only servers that store signed
//! events and replay them against subscription filters. This engine
//! only needs two operations from a relay pool — subscribe with a
//! filter, publish an event — expressed by the [`Relay`] trait.
//!
//! A subscription first replays matching stored events, then signals
//! end-of-stored with [`RelayUpdate::EndOfStored`], then keeps
//! delivering matching live events until closed.
//!
//! [`MemoryRelay`] is an in-process implementation with the same
//! semantics, used by tests and local demos.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MurmurError, MurmurResult};
use crate::event::{Event, Kind};
use crate::identity::Pubkey;

/// Capacity of the live-event fanout channel inside [`MemoryRelay`].
const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Subscription filter: every populated field must match.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Match any of these kinds (empty = any kind)
    pub kinds: Vec<Kind>,
    /// Match any of these authors (empty = any author)
    pub authors: Vec<Pubkey>,
    /// Match events `p`-tagged to any of these keys (empty = no tag constraint)
    pub recipients: Vec<Pubkey>,
    /// Only events with `created_at >= since`
    pub since: Option<i64>,
    /// Only events with `created_at <= until`
    pub until: Option<i64>,
    /// Replay at most this many stored events (newest first)
    pub limit: Option<usize>,
}

impl Filter {
    /// Empty filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Restrict to the given authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = Pubkey>) -> Self {
        self.authors = authors.into_iter().collect();
        self
    }

    /// Restrict to events addressed to the given keys.
    pub fn recipients(mut self, recipients: impl IntoIterator<Item = Pubkey>) -> Self {
        self.recipients = recipients.into_iter().collect();
        self
    }

    /// Lower timestamp bound (inclusive).
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Upper timestamp bound (inclusive).
    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    /// Stored-replay page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.recipients.is_empty() {
            let addressed = event
                .recipient()
                .map(|r| self.recipients.contains(&r))
                .unwrap_or(false);
            if !addressed {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

/// One delivery from a subscription.
#[derive(Clone, Debug)]
pub enum RelayUpdate {
    /// A matching event (stored replay or live)
    Event(Event),
    /// All stored events have been replayed
    EndOfStored,
}

/// Handle to an open subscription; dropping or closing it stops delivery.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Create a handle around a cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Stop the subscription.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The relay pool collaborator.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Open a subscription delivering [`RelayUpdate`]s into `tx`.
    async fn subscribe(
        &self,
        filter: Filter,
        tx: mpsc::Sender<RelayUpdate>,
    ) -> MurmurResult<SubscriptionHandle>;

    /// Publish an event to the pool.
    async fn publish(&self, event: Event) -> MurmurResult<()>;
}

/// In-process relay with stored replay, end-of-stored signaling, and
/// live delivery.
pub struct MemoryRelay {
    stored: Mutex<Vec<Event>>,
    live: broadcast::Sender<Event>,
    /// When true, `publish` returns an error (for failure-path tests).
    reject_publishes: Mutex<bool>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Arc::new(Self {
            stored: Mutex::new(Vec::new()),
            live,
            reject_publishes: Mutex::new(false),
        })
    }

    /// Seed a stored event without going through `publish`.
    pub fn store(&self, event: Event) {
        self.stored.lock().push(event);
    }

    /// Number of stored events.
    pub fn stored_count(&self) -> usize {
        self.stored.lock().len()
    }

    /// Make subsequent publishes fail.
    pub fn set_reject_publishes(&self, reject: bool) {
        *self.reject_publishes.lock() = reject;
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn subscribe(
        &self,
        filter: Filter,
        tx: mpsc::Sender<RelayUpdate>,
    ) -> MurmurResult<SubscriptionHandle> {
        // Snapshot matching stored events, newest first, bounded by limit.
        let mut replay: Vec<Event> = self
            .stored
            .lock()
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        replay.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            replay.truncate(limit);
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let mut live_rx = self.live.subscribe();

        tokio::spawn(async move {
            for event in replay {
                if tx.send(RelayUpdate::Event(event)).await.is_err() {
                    return;
                }
            }
            if tx.send(RelayUpdate::EndOfStored).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = live_rx.recv() => match received {
                        Ok(event) if filter.matches(&event) => {
                            if tx.send(RelayUpdate::Event(event)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "subscription lagged behind live events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(SubscriptionHandle::new(cancel))
    }

    async fn publish(&self, event: Event) -> MurmurResult<()> {
        if *self.reject_publishes.lock() {
            return Err(MurmurError::Relay("publish rejected".to_string()));
        }
        self.stored.lock().push(event.clone());
        let _ = self.live.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::identity::Identity;

    fn signed_event(seed: u8, created_at: i64, kind: Kind, recipient: Option<&Pubkey>) -> Event {
        let author = Identity::from_seed(&[seed; 32]);
        let tags = recipient.map(|r| vec![Tag::recipient(r)]).unwrap_or_default();
        Event::sign_new(&author, created_at, kind, tags, "ct".to_string()).expect("Should sign")
    }

    #[test]
    fn test_filter_matches_kind_and_author() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let event = signed_event(1, 1000, Kind::LEGACY_DM, None);

        assert!(Filter::new().kinds([Kind::LEGACY_DM]).matches(&event));
        assert!(!Filter::new().kinds([Kind::ENVELOPE]).matches(&event));
        assert!(Filter::new().authors([alice.pubkey()]).matches(&event));
    }

    #[test]
    fn test_filter_matches_recipient_tag() {
        let bob = Identity::from_seed(&[2u8; 32]).pubkey();
        let carol = Identity::from_seed(&[3u8; 32]).pubkey();
        let event = signed_event(1, 1000, Kind::ENVELOPE, Some(&bob));

        assert!(Filter::new().recipients([bob]).matches(&event));
        assert!(!Filter::new().recipients([carol]).matches(&event));
    }

    #[test]
    fn test_filter_time_bounds() {
        let event = signed_event(1, 1000, Kind::CHAT, None);

        assert!(Filter::new().since(1000).matches(&event));
        assert!(!Filter::new().since(1001).matches(&event));
        assert!(Filter::new().until(1000).matches(&event));
        assert!(!Filter::new().until(999).matches(&event));
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_signals_end() {
        let relay = MemoryRelay::new();
        let bob = Identity::from_seed(&[2u8; 32]).pubkey();
        relay.store(signed_event(1, 1000, Kind::ENVELOPE, Some(&bob)));
        relay.store(signed_event(1, 2000, Kind::ENVELOPE, Some(&bob)));

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = relay
            .subscribe(Filter::new().recipients([bob]), tx)
            .await
            .expect("Should subscribe");

        let mut events = 0;
        loop {
            match rx.recv().await.expect("Should receive") {
                RelayUpdate::Event(_) => events += 1,
                RelayUpdate::EndOfStored => break,
            }
        }
        assert_eq!(events, 2);
    }

    #[tokio::test]
    async fn test_subscribe_respects_limit_newest_first() {
        let relay = MemoryRelay::new();
        let bob = Identity::from_seed(&[2u8; 32]).pubkey();
        for ts in [1000, 2000, 3000] {
            relay.store(signed_event(1, ts, Kind::ENVELOPE, Some(&bob)));
        }

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = relay
            .subscribe(Filter::new().recipients([bob]).limit(2), tx)
            .await
            .expect("Should subscribe");

        let mut seen = Vec::new();
        loop {
            match rx.recv().await.expect("Should receive") {
                RelayUpdate::Event(event) => seen.push(event.created_at),
                RelayUpdate::EndOfStored => break,
            }
        }
        assert_eq!(seen, vec![3000, 2000]);
    }

    #[tokio::test]
    async fn test_live_events_delivered_after_end_of_stored() {
        let relay = MemoryRelay::new();
        let bob = Identity::from_seed(&[2u8; 32]).pubkey();

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = relay
            .subscribe(Filter::new().recipients([bob]), tx)
            .await
            .expect("Should subscribe");

        assert!(matches!(
            rx.recv().await.expect("Should receive"),
            RelayUpdate::EndOfStored
        ));

        relay
            .publish(signed_event(1, 5000, Kind::ENVELOPE, Some(&bob)))
            .await
            .expect("Should publish");

        assert!(matches!(
            rx.recv().await.expect("Should receive"),
            RelayUpdate::Event(event) if event.created_at == 5000
        ));
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivery() {
        let relay = MemoryRelay::new();
        let bob = Identity::from_seed(&[2u8; 32]).pubkey();

        let (tx, mut rx) = mpsc::channel(16);
        let handle = relay
            .subscribe(Filter::new().recipients([bob]), tx)
            .await
            .expect("Should subscribe");

        assert!(matches!(
            rx.recv().await.expect("Should receive"),
            RelayUpdate::EndOfStored
        ));

        handle.close();
        // Give the forwarding task a moment to observe the cancel.
        tokio::task::yield_now().await;
        relay
            .publish(signed_event(1, 5000, Kind::ENVELOPE, Some(&bob)))
            .await
            .expect("Should publish");

        assert!(rx.recv().await.is_none());
    }
}
