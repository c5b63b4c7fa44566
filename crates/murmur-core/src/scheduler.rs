//! Serialized interactive decryption
//!
//! When the account's keys live in an external authority, every decrypt
//! can pop an approval prompt. A burst of inbound envelopes must not
//! open a stack of prompts at once, so all interactive unwraps funnel
//! through this single-consumer queue:
//!
//! - Strict FIFO: jobs resolve in enqueue order regardless of how fast
//!   their underlying crypto would finish
//! - One job at a time, with a short fixed pause between jobs
//! - [`DecryptScheduler::clear`] cancels everything pending (and the job
//!   in flight) with [`MurmurError::QueueCleared`]; used on logout and
//!   view teardown
//!
//! Decrypts that only need a locally held key never pass through here;
//! they run directly and concurrently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{self, Unwrapped};
use crate::crypto::CryptoEnvelope;
use crate::error::{MurmurError, MurmurResult};
use crate::event::Event;

/// Maximum number of jobs waiting in the queue.
const QUEUE_CAPACITY: usize = 256;

/// Pause between consecutive jobs, so back-to-back prompts don't blur
/// into one another.
const DRAIN_PAUSE: Duration = Duration::from_millis(50);

/// One queued unwrap request.
#[derive(Debug)]
pub enum UnwrapJob {
    /// Three-layer envelope unwrap
    Envelope(Event),
    /// Flat legacy message unwrap
    Legacy(Event),
}

struct QueueItem {
    job: UnwrapJob,
    respond: oneshot::Sender<MurmurResult<Option<Unwrapped>>>,
}

struct Generation {
    tx: mpsc::Sender<QueueItem>,
    cancel: CancellationToken,
}

/// FIFO queue with a single consumer task for interactive unwraps.
pub struct DecryptScheduler {
    crypto: Arc<CryptoEnvelope>,
    current: Mutex<Generation>,
}

impl DecryptScheduler {
    /// Create the scheduler and start its consumer task.
    pub fn new(crypto: Arc<CryptoEnvelope>) -> Self {
        let generation = Self::start_generation(crypto.clone());
        Self {
            crypto,
            current: Mutex::new(generation),
        }
    }

    fn start_generation(crypto: Arc<CryptoEnvelope>) -> Generation {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(consumer_loop(crypto, rx, cancel.clone()));
        Generation { tx, cancel }
    }

    /// Enqueue an unwrap job and wait for its result.
    ///
    /// Jobs settle in enqueue order. If the queue is cleared before or
    /// while this job runs, the call resolves with
    /// [`MurmurError::QueueCleared`].
    pub async fn enqueue(&self, job: UnwrapJob) -> MurmurResult<Option<Unwrapped>> {
        let tx = self.current.lock().tx.clone();
        let (respond, receive) = oneshot::channel();

        tx.send(QueueItem { job, respond })
            .await
            .map_err(|_| MurmurError::QueueCleared)?;

        receive.await.map_err(|_| MurmurError::QueueCleared)?
    }

    /// Reject every pending job (and the one in flight) and reset.
    ///
    /// Jobs enqueued after this call go to a fresh queue and run
    /// normally.
    pub fn clear(&self) {
        let mut current = self.current.lock();
        current.cancel.cancel();
        *current = Self::start_generation(self.crypto.clone());
        debug!("decryption queue cleared");
    }
}

impl Drop for DecryptScheduler {
    fn drop(&mut self) {
        self.current.lock().cancel.cancel();
    }
}

async fn consumer_loop(
    crypto: Arc<CryptoEnvelope>,
    mut rx: mpsc::Receiver<QueueItem>,
    cancel: CancellationToken,
) {
    loop {
        let QueueItem { job, respond } = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        // The job itself can suspend indefinitely on a user prompt, so a
        // clear() must also settle the in-flight job.
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = respond.send(Err(MurmurError::QueueCleared));
                break;
            }
            result = run_job(&crypto, &job) => result,
        };
        let _ = respond.send(result);

        tokio::time::sleep(DRAIN_PAUSE).await;
    }

    // Cancelled: reject whatever is still buffered.
    rx.close();
    while let Ok(item) = rx.try_recv() {
        let _ = item.respond.send(Err(MurmurError::QueueCleared));
    }
}

async fn run_job(crypto: &CryptoEnvelope, job: &UnwrapJob) -> MurmurResult<Option<Unwrapped>> {
    match job {
        UnwrapJob::Envelope(event) => Ok(codec::unwrap_envelope(event, crypto)
            .await?
            .map(Unwrapped::Sealed)),
        UnwrapJob::Legacy(event) => Ok(codec::unwrap_legacy(event, crypto)
            .await?
            .map(Unwrapped::Legacy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_envelope;
    use crate::crypto::{Algorithm, SignerAuthority};
    use crate::identity::{Identity, Pubkey};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_crypto(seed: u8) -> Arc<CryptoEnvelope> {
        Arc::new(CryptoEnvelope::local(Identity::from_seed(&[seed; 32])))
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_resolves_in_fifo_order() {
        let alice = CryptoEnvelope::local(Identity::from_seed(&[1u8; 32]));
        let bob = local_crypto(2);
        let scheduler = Arc::new(DecryptScheduler::new(bob.clone()));

        let mut handles = Vec::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let pair = build_envelope(&format!("msg {}", i), &bob.pubkey(), &alice)
                .await
                .expect("Should build");
            let scheduler = scheduler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let result = scheduler
                    .enqueue(UnwrapJob::Envelope(pair.recipient_envelope))
                    .await
                    .expect("Should unwrap")
                    .expect("Should decode");
                if let Unwrapped::Sealed(rumor) = result {
                    order.lock().push(rumor.content);
                }
            }));
            // Stagger the enqueues so the order is deterministic.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.expect("Task should finish");
        }

        let order = order.lock().clone();
        assert_eq!(order, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejects_pending() {
        // An authority that never answers, so jobs stay pending forever.
        struct StalledAuthority;

        #[async_trait]
        impl SignerAuthority for StalledAuthority {
            async fn encrypt(
                &self,
                _algorithm: Algorithm,
                _counterparty: &Pubkey,
                _plaintext: &str,
            ) -> MurmurResult<String> {
                std::future::pending().await
            }

            async fn decrypt(
                &self,
                _algorithm: Algorithm,
                _counterparty: &Pubkey,
                _ciphertext: &str,
            ) -> MurmurResult<String> {
                std::future::pending().await
            }
        }

        let alice = CryptoEnvelope::local(Identity::from_seed(&[1u8; 32]));
        let bob_keys = Identity::from_seed(&[2u8; 32]);
        let bob = Arc::new(CryptoEnvelope::delegated(
            bob_keys.pubkey(),
            Arc::new(StalledAuthority),
        ));
        let scheduler = Arc::new(DecryptScheduler::new(bob.clone()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let pair = build_envelope(&format!("stuck {}", i), &bob.pubkey(), &alice)
                .await
                .expect("Should build");
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(UnwrapJob::Envelope(pair.recipient_envelope))
                    .await
            }));
        }

        // Let the enqueues land and the first job start its prompt.
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.clear();

        for handle in handles {
            let result = handle.await.expect("Task should finish");
            assert!(matches!(result, Err(MurmurError::QueueCleared)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_usable_after_clear() {
        let alice = CryptoEnvelope::local(Identity::from_seed(&[1u8; 32]));
        let bob = local_crypto(2);
        let scheduler = DecryptScheduler::new(bob.clone());

        scheduler.clear();

        let pair = build_envelope("after clear", &bob.pubkey(), &alice)
            .await
            .expect("Should build");
        let result = scheduler
            .enqueue(UnwrapJob::Envelope(pair.recipient_envelope))
            .await
            .expect("Should unwrap")
            .expect("Should decode");
        assert!(matches!(result, Unwrapped::Sealed(rumor) if rumor.content == "after clear"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_jobs_run_through_queue() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = local_crypto(2);
        let scheduler = DecryptScheduler::new(bob.clone());
        let now = chrono::Utc::now().timestamp();

        let content = crate::crypto::legacy::encrypt(&alice, &bob.pubkey(), "old")
            .expect("Should encrypt");
        let event = Event::sign_new(
            &alice,
            now,
            crate::event::Kind::LEGACY_DM,
            vec![crate::event::Tag::recipient(&bob.pubkey())],
            content,
        )
        .expect("Should sign");

        let result = scheduler
            .enqueue(UnwrapJob::Legacy(event))
            .await
            .expect("Should unwrap")
            .expect("Should decode");
        assert!(matches!(result, Unwrapped::Legacy(msg) if msg.content == "old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_processed_one_at_a_time() {
        // A counting authority records the maximum concurrency it saw.
        struct CountingAuthority {
            inner: Identity,
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl SignerAuthority for CountingAuthority {
            async fn encrypt(
                &self,
                _algorithm: Algorithm,
                counterparty: &Pubkey,
                plaintext: &str,
            ) -> MurmurResult<String> {
                crate::crypto::modern::encrypt(&self.inner, counterparty, plaintext)
            }

            async fn decrypt(
                &self,
                _algorithm: Algorithm,
                counterparty: &Pubkey,
                ciphertext: &str,
            ) -> MurmurResult<String> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let result = crate::crypto::modern::decrypt(&self.inner, counterparty, ciphertext);
                self.active.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }

        let alice = CryptoEnvelope::local(Identity::from_seed(&[1u8; 32]));
        let bob_keys = Identity::from_seed(&[2u8; 32]);
        let authority = Arc::new(CountingAuthority {
            inner: bob_keys.clone(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let bob = Arc::new(CryptoEnvelope::delegated(
            bob_keys.pubkey(),
            authority.clone(),
        ));
        let scheduler = Arc::new(DecryptScheduler::new(bob.clone()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let pair = build_envelope(&format!("m{}", i), &bob.pubkey(), &alice)
                .await
                .expect("Should build");
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(UnwrapJob::Envelope(pair.recipient_envelope))
                    .await
            }));
        }

        for handle in handles {
            handle
                .await
                .expect("Task should finish")
                .expect("Should unwrap");
        }

        assert_eq!(authority.peak.load(Ordering::SeqCst), 1);
    }
}
