//! Incremental and paginated message synchronization
//!
//! The [`SyncController`] turns the relay's stream of opaque signed
//! events into chat-store mutations. Every pass runs two independent
//! sweeps:
//!
//! - **inbound**: envelopes and legacy messages `p`-tagged to the local
//!   identity
//! - **outbound**: legacy messages authored by the local identity
//!   (envelopes never carry the real author, so the sender's copies of
//!   sealed traffic arrive through the inbound sweep instead)
//!
//! Each matching event spawns an independent unwrap task; interactive
//! accounts route through the [`DecryptScheduler`]. A sweep is not
//! complete when the relay signals end-of-stored — it is complete when
//! every spawned unwrap has settled, otherwise callers would observe a
//! "fully synced" state while messages are still decrypting.
//!
//! Per-event failures are logged and isolated; only a missing key
//! capability aborts a pass. Re-running a pass over the same window is
//! harmless because the chat store deduplicates by message id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{self, Unwrapped};
use crate::crypto::{Algorithm, CryptoEnvelope};
use crate::error::{MurmurError, MurmurResult};
use crate::event::{Event, Kind};
use crate::relay::{Filter, Relay, RelayUpdate};
use crate::scheduler::{DecryptScheduler, UnwrapJob};
use crate::store::{ChatStore, DirectMessage};

/// Page size for backward pagination.
pub const PAGE_SIZE: usize = 100;

/// Time budget for one sweep before its subscription is forcibly closed.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the per-sweep delivery channel.
const SWEEP_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Cursors {
    /// Incremental watermark: next `load` only asks for events after this
    last_checked: Option<i64>,
    /// Oldest event timestamp seen so far, for backward pagination
    oldest_seen: Option<i64>,
    /// Whether a first sync ever completed with results
    synced_once: bool,
    /// Whether older pages may still exist
    more_available: bool,
}

#[derive(Debug, Default)]
struct SweepStats {
    /// Matching events delivered before end-of-stored
    events: usize,
    /// Sweep hit its time budget and was closed early
    timed_out: bool,
    /// Oldest `created_at` among delivered events
    oldest: Option<i64>,
}

/// Drives sync passes against the relay collaborator.
pub struct SyncController {
    crypto: Arc<CryptoEnvelope>,
    scheduler: Arc<DecryptScheduler>,
    store: Arc<ChatStore>,
    relay: Arc<dyn Relay>,
    cursors: Mutex<Cursors>,
    loading: AtomicBool,
}

impl SyncController {
    /// Wire a controller over its collaborators.
    pub fn new(
        crypto: Arc<CryptoEnvelope>,
        scheduler: Arc<DecryptScheduler>,
        store: Arc<ChatStore>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self {
            crypto,
            scheduler,
            store,
            relay,
            cursors: Mutex::new(Cursors {
                more_available: true,
                ..Cursors::default()
            }),
            loading: AtomicBool::new(false),
        }
    }

    /// Whether a pass is currently running (including still-draining
    /// unwraps after end-of-stored).
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Whether older pages may still exist for [`load_more`](Self::load_more).
    pub fn more_available(&self) -> bool {
        self.cursors.lock().more_available
    }

    /// The incremental watermark, if a sync has completed.
    pub fn last_checked(&self) -> Option<i64> {
        self.cursors.lock().last_checked
    }

    /// Run an incremental pass (or the first full pass).
    ///
    /// Issues both sweeps from the current watermark. The watermark only
    /// advances past a first-ever sync when that sync saw results, so an
    /// empty relay at startup does not strand a later full load.
    pub async fn load(&self) -> MurmurResult<()> {
        if self.loading.swap(true, Ordering::SeqCst) {
            debug!("sync already in progress, skipping");
            return Ok(());
        }
        let result = self.load_pass().await;
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    async fn load_pass(&self) -> MurmurResult<()> {
        let since = self.cursors.lock().last_checked;
        let now = chrono::Utc::now().timestamp();

        let (mut inbound, mut outbound) = self.base_filters();
        if let Some(since) = since {
            inbound = inbound.since(since);
            outbound = outbound.since(since);
        }

        let (inbound, outbound) = tokio::join!(self.sweep(inbound), self.sweep(outbound));
        let (inbound, outbound) = (inbound?, outbound?);
        let total = inbound.events + outbound.events;
        let timed_out = inbound.timed_out || outbound.timed_out;

        {
            let mut cursors = self.cursors.lock();
            // A timed-out sweep keeps its partial results but must not
            // advance the watermark past events it never saw.
            if !timed_out {
                if cursors.synced_once {
                    cursors.last_checked = Some(now);
                } else if total > 0 {
                    cursors.synced_once = true;
                    cursors.last_checked = Some(now);
                }
            }
            Self::lower_oldest(&mut cursors, &inbound, &outbound);
        }

        if timed_out {
            return Err(MurmurError::SyncTimeout(SWEEP_TIMEOUT));
        }
        Ok(())
    }

    /// Page backwards past the oldest event seen so far.
    ///
    /// Returns whether more pages may still exist; both sweeps returning
    /// short pages means the history is exhausted.
    pub async fn load_more(&self) -> MurmurResult<bool> {
        let until = {
            let cursors = self.cursors.lock();
            if !cursors.more_available {
                return Ok(false);
            }
            cursors
                .oldest_seen
                .map(|oldest| oldest - 1)
                .unwrap_or_else(|| chrono::Utc::now().timestamp())
        };

        let (inbound, outbound) = self.base_filters();
        let inbound = inbound.until(until).limit(PAGE_SIZE);
        let outbound = outbound.until(until).limit(PAGE_SIZE);

        let (inbound, outbound) = tokio::join!(self.sweep(inbound), self.sweep(outbound));
        let (inbound, outbound) = (inbound?, outbound?);

        let more = inbound.events >= PAGE_SIZE || outbound.events >= PAGE_SIZE;
        {
            let mut cursors = self.cursors.lock();
            // An interrupted page may have missed events; keep paging.
            cursors.more_available = more || inbound.timed_out || outbound.timed_out;
            Self::lower_oldest(&mut cursors, &inbound, &outbound);
        }

        if inbound.timed_out || outbound.timed_out {
            return Err(MurmurError::SyncTimeout(SWEEP_TIMEOUT));
        }
        Ok(more)
    }

    fn base_filters(&self) -> (Filter, Filter) {
        let me = self.crypto.pubkey();
        let inbound = Filter::new()
            .kinds([Kind::ENVELOPE, Kind::LEGACY_DM])
            .recipients([me]);
        let outbound = Filter::new().kinds([Kind::LEGACY_DM]).authors([me]);
        (inbound, outbound)
    }

    fn lower_oldest(cursors: &mut Cursors, inbound: &SweepStats, outbound: &SweepStats) {
        for stats in [inbound, outbound] {
            if let Some(oldest) = stats.oldest {
                cursors.oldest_seen = Some(match cursors.oldest_seen {
                    Some(current) => current.min(oldest),
                    None => oldest,
                });
            }
        }
    }

    /// Run one subscription sweep to completion.
    ///
    /// Spawns an unwrap task per delivered event and drains them all
    /// before returning, even when the subscription itself timed out.
    async fn sweep(&self, filter: Filter) -> MurmurResult<SweepStats> {
        let (tx, mut rx) = mpsc::channel(SWEEP_CHANNEL_CAPACITY);
        let handle = self.relay.subscribe(filter, tx).await?;

        let mut stats = SweepStats::default();
        let mut unwraps: JoinSet<MurmurResult<()>> = JoinSet::new();

        let deadline = tokio::time::sleep(SWEEP_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("sweep timed out, closing subscription with partial results");
                    stats.timed_out = true;
                    break;
                }
                update = rx.recv() => match update {
                    Some(RelayUpdate::Event(event)) => {
                        stats.events += 1;
                        stats.oldest = Some(match stats.oldest {
                            Some(oldest) => oldest.min(event.created_at),
                            None => event.created_at,
                        });

                        let crypto = self.crypto.clone();
                        let scheduler = self.scheduler.clone();
                        let store = self.store.clone();
                        unwraps.spawn(async move {
                            process_event(&crypto, &scheduler, &store, event).await
                        });
                    }
                    Some(RelayUpdate::EndOfStored) | None => break,
                },
            }
        }
        handle.close();

        // End-of-stored is not sweep completion: every in-flight unwrap
        // must settle first.
        let mut fatal = None;
        while let Some(joined) = unwraps.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_fatal() => fatal = Some(err),
                Ok(Err(err)) => debug!(error = %err, "event dropped during sweep"),
                Err(join_err) => warn!(error = %join_err, "unwrap task aborted"),
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cursors = self.cursors.lock();
        f.debug_struct("SyncController")
            .field("loading", &self.is_loading())
            .field("last_checked", &cursors.last_checked)
            .field("oldest_seen", &cursors.oldest_seen)
            .field("more_available", &cursors.more_available)
            .finish()
    }
}

/// Unwrap one relay event and file the result into the chat store.
async fn process_event(
    crypto: &CryptoEnvelope,
    scheduler: &DecryptScheduler,
    store: &ChatStore,
    event: Event,
) -> MurmurResult<()> {
    let me = crypto.pubkey();

    if event.kind == Kind::ENVELOPE {
        let unwrapped = if crypto.is_interactive() {
            scheduler.enqueue(UnwrapJob::Envelope(event.clone())).await?
        } else {
            codec::unwrap_envelope(&event, crypto)
                .await?
                .map(Unwrapped::Sealed)
        };
        let Some(Unwrapped::Sealed(rumor)) = unwrapped else {
            return Ok(());
        };

        let counterparty = if rumor.pubkey == me {
            match rumor.recipient() {
                Some(recipient) => recipient,
                None => {
                    warn!(message = %rumor.id, "own message has no counterpart tag");
                    return Ok(());
                }
            }
        } else {
            rumor.pubkey
        };
        let message = DirectMessage::from_rumor(&rumor, &me, Algorithm::Modern);
        store.add_message(&counterparty, message);
    } else if event.kind == Kind::LEGACY_DM {
        let unwrapped = if crypto.is_interactive() {
            scheduler.enqueue(UnwrapJob::Legacy(event.clone())).await?
        } else {
            codec::unwrap_legacy(&event, crypto)
                .await?
                .map(Unwrapped::Legacy)
        };
        let Some(Unwrapped::Legacy(decrypted)) = unwrapped else {
            return Ok(());
        };

        let counterparty = decrypted.counterparty;
        let message = DirectMessage::from_legacy(&event, &decrypted, &me);
        store.add_message(&counterparty, message);
    } else {
        debug!(event = %event.id, kind = event.kind.0, "ignoring unrelated event kind");
    }
    Ok(())
}
