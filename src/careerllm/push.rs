//! Push fabric: per-user event bus with authenticated subscriptions.
//!
//! Every live client connection is a [`Subscription`]: a bounded queue the
//! transport drains, bound to exactly one user. Publishing enqueues to
//! every live subscription of the target user and never blocks; a
//! subscriber that cannot drain in time receives one final
//! `error{subscriber_backpressure}` envelope and is disconnected, leaving
//! other subscribers of the same user untouched.
//!
//! Authentication happens as the first inbound message after connect: the
//! transport calls [`PushFabric::connect`], collects the client's proof,
//! and completes the handshake with
//! [`PendingSubscription::authenticate`] inside a short grace window.
//! Proofs are compared constant-time over SHA-256 digests.
//!
//! Heartbeats: a `ping` recorded via [`PushFabric::heartbeat`] elicits a
//! `pong` envelope on that subscription alone; subscriptions idle for more
//! than twice the heartbeat interval are closed by
//! [`PushFabric::reap_idle`] (spawn [`PushFabric::start_reaper`] to run it
//! periodically).
//!
//! Sequence numbers are assigned per subscription, starting at 1, strictly
//! increasing.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use crate::careerllm::config::PushConfig;
use crate::careerllm::error::ErrorKind;
use crate::careerllm::event::{EventEnvelope, TurnEvent};
use crate::careerllm::store::new_id;

/// Validates subscription auth proofs.
pub trait SubscriptionAuth: Send + Sync {
    /// Whether `proof` authenticates `user_id`.
    fn validate(&self, user_id: &str, proof: &str) -> bool;
}

/// Token-table authenticator comparing SHA-256 digests in constant time.
pub struct TokenAuth {
    tokens: HashMap<String, String>,
}

impl TokenAuth {
    /// Build from `(user_id, token)` pairs.
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            tokens: pairs
                .iter()
                .map(|(u, t)| (u.to_string(), t.to_string()))
                .collect(),
        }
    }
}

impl SubscriptionAuth for TokenAuth {
    fn validate(&self, user_id: &str, proof: &str) -> bool {
        match self.tokens.get(user_id) {
            Some(expected) => {
                // Digest-then-compare keeps the comparison constant time
                // regardless of token lengths.
                let expected_hash = Sha256::digest(expected.as_bytes());
                let provided_hash = Sha256::digest(proof.as_bytes());
                expected_hash.ct_eq(&provided_hash).into()
            }
            None => false,
        }
    }
}

/// Accepts any proof. For tests and trusted single-process embeddings.
pub struct OpenAuth;

impl SubscriptionAuth for OpenAuth {
    fn validate(&self, _user_id: &str, _proof: &str) -> bool {
        true
    }
}

/// Errors surfaced by subscription operations.
#[derive(Debug, Clone)]
pub enum PushError {
    /// The proof did not authenticate the claimed user.
    Unauthorized,
    /// The grace window elapsed before authentication completed.
    GraceExpired,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Unauthorized => write!(f, "subscription proof rejected"),
            PushError::GraceExpired => write!(f, "authentication grace window elapsed"),
        }
    }
}

impl Error for PushError {}

/// One live, authenticated push channel bound to a user.
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    events: mpsc::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Next envelope, or `None` once the subscription is closed.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`next_event`](Subscription::next_event).
    pub fn try_next_event(&mut self) -> Option<EventEnvelope> {
        self.events.try_recv().ok()
    }
}

/// A connection that has not authenticated yet.
pub struct PendingSubscription {
    fabric: Arc<FabricInner>,
    opened_at: Instant,
}

impl PendingSubscription {
    /// Complete the handshake. Fails closed when the proof is bad or the
    /// grace window has already elapsed.
    pub fn authenticate(self, user_id: &str, proof: &str) -> Result<Subscription, PushError> {
        if self.opened_at.elapsed() > self.fabric.config.auth_grace {
            return Err(PushError::GraceExpired);
        }
        if !self.fabric.auth.validate(user_id, proof) {
            return Err(PushError::Unauthorized);
        }
        Ok(self.fabric.attach(user_id))
    }
}

struct SubscriptionHandle {
    id: String,
    sender: mpsc::Sender<EventEnvelope>,
    seq: AtomicU64,
    last_beat: Mutex<Instant>,
}

impl SubscriptionHandle {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct FabricInner {
    auth: Arc<dyn SubscriptionAuth>,
    config: PushConfig,
    subscriptions: Mutex<HashMap<String, Vec<Arc<SubscriptionHandle>>>>,
}

impl FabricInner {
    fn attach(&self, user_id: &str) -> Subscription {
        // One extra slot stays reserved for the terminal backpressure
        // error, so a full queue can still say goodbye.
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity + 1);
        let handle = Arc::new(SubscriptionHandle {
            id: new_id(),
            sender,
            seq: AtomicU64::new(0),
            last_beat: Mutex::new(Instant::now()),
        });
        let subscription = Subscription {
            id: handle.id.clone(),
            user_id: user_id.to_string(),
            events: receiver,
        };
        self.subscriptions
            .lock()
            .expect("subscription lock")
            .entry(user_id.to_string())
            .or_insert_with(Vec::new)
            .push(handle);
        subscription
    }

    fn detach(&self, user_id: &str, subscription_id: &str) {
        let mut table = self.subscriptions.lock().expect("subscription lock");
        if let Some(handles) = table.get_mut(user_id) {
            handles.retain(|h| h.id != subscription_id);
            if handles.is_empty() {
                table.remove(user_id);
            }
        }
    }

    fn handles_for(&self, user_id: &str) -> Vec<Arc<SubscriptionHandle>> {
        self.subscriptions
            .lock()
            .expect("subscription lock")
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver one event to one handle. Returns false when the handle must
    /// be disconnected.
    fn deliver(&self, handle: &SubscriptionHandle, event: &TurnEvent) -> bool {
        // capacity() is the remaining room; 1 means only the reserved
        // terminal slot is left, which counts as backpressure.
        if handle.sender.capacity() <= 1 {
            let envelope = EventEnvelope {
                seq: handle.next_seq(),
                event: TurnEvent::Error {
                    kind: ErrorKind::SubscriberBackpressure,
                    message: Some("subscriber too slow, disconnecting".to_string()),
                },
            };
            let _ = handle.sender.try_send(envelope);
            return false;
        }
        let envelope = EventEnvelope {
            seq: handle.next_seq(),
            event: event.clone(),
        };
        handle.sender.try_send(envelope).is_ok()
    }
}

/// Per-user topic bus.
#[derive(Clone)]
pub struct PushFabric {
    inner: Arc<FabricInner>,
}

impl PushFabric {
    pub fn new(auth: Arc<dyn SubscriptionAuth>, config: PushConfig) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                auth,
                config,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open an unauthenticated connection; the grace window starts now.
    pub fn connect(&self) -> PendingSubscription {
        PendingSubscription {
            fabric: Arc::clone(&self.inner),
            opened_at: Instant::now(),
        }
    }

    /// Connect and authenticate in one call.
    pub fn subscribe(&self, user_id: &str, proof: &str) -> Result<Subscription, PushError> {
        self.connect().authenticate(user_id, proof)
    }

    /// Drop a subscription, releasing its queue.
    pub fn disconnect(&self, user_id: &str, subscription_id: &str) {
        self.inner.detach(user_id, subscription_id);
    }

    /// Enqueue `event` to every live subscription of `user_id`. Slow or
    /// closed subscribers are disconnected; the publisher never blocks.
    pub async fn publish(&self, user_id: &str, event: &TurnEvent) {
        for handle in self.inner.handles_for(user_id) {
            if !self.inner.deliver(&handle, event) {
                log::warn!(
                    "disconnecting subscription {} for user {}",
                    handle.id,
                    user_id
                );
                self.inner.detach(user_id, &handle.id);
            }
        }
    }

    /// Record a client `ping` and answer `pong` on that subscription only.
    pub async fn heartbeat(&self, user_id: &str, subscription_id: &str) {
        for handle in self.inner.handles_for(user_id) {
            if handle.id == subscription_id {
                *handle.last_beat.lock().expect("heartbeat lock") = Instant::now();
                if !self.inner.deliver(&handle, &TurnEvent::Pong) {
                    self.inner.detach(user_id, &handle.id);
                }
            }
        }
    }

    /// Close every subscription idle for more than twice the heartbeat
    /// interval. Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let cutoff = self.inner.config.heartbeat_interval * 2;
        let stale: Vec<(String, String)> = {
            let table = self.inner.subscriptions.lock().expect("subscription lock");
            table
                .iter()
                .flat_map(|(user, handles)| {
                    handles.iter().filter_map(move |h| {
                        let idle = h.last_beat.lock().expect("heartbeat lock").elapsed();
                        if idle > cutoff {
                            Some((user.clone(), h.id.clone()))
                        } else {
                            None
                        }
                    })
                })
                .collect()
        };
        let count = stale.len();
        for (user, id) in stale {
            log::info!("closing idle subscription {} for user {}", id, user);
            self.inner.detach(&user, &id);
        }
        count
    }

    /// Spawn a task that runs [`reap_idle`](PushFabric::reap_idle) on the
    /// heartbeat interval until the fabric is dropped.
    pub fn start_reaper(&self) -> tokio::task::JoinHandle<()> {
        let fabric = self.clone();
        let period = self.inner.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                fabric.reap_idle();
            }
        })
    }

    /// Number of live subscriptions for a user.
    pub fn subscription_count(&self, user_id: &str) -> usize {
        self.inner.handles_for(user_id).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fabric() -> PushFabric {
        PushFabric::new(
            Arc::new(TokenAuth::new(&[("u1", "secret-1"), ("u2", "secret-2")])),
            PushConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_only_the_target_user() {
        let fabric = fabric();
        let mut sub1 = fabric.subscribe("u1", "secret-1").unwrap();
        let mut sub2 = fabric.subscribe("u2", "secret-2").unwrap();

        fabric.publish("u1", &TurnEvent::Pong).await;

        assert!(sub1.try_next_event().is_some());
        assert!(sub2.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_bad_proof_is_rejected() {
        let fabric = fabric();
        assert!(matches!(
            fabric.subscribe("u1", "wrong"),
            Err(PushError::Unauthorized)
        ));
        assert!(matches!(
            fabric.subscribe("unknown", "secret-1"),
            Err(PushError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one_and_increase() {
        let fabric = fabric();
        let mut sub = fabric.subscribe("u1", "secret-1").unwrap();
        for _ in 0..3 {
            fabric.publish("u1", &TurnEvent::Pong).await;
        }
        let seqs: Vec<u64> = (0..3)
            .filter_map(|_| sub.try_next_event().map(|e| e.seq))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_backpressure_disconnects_with_terminal_error() {
        let mut config = PushConfig::default();
        config.queue_capacity = 4;
        let fabric = PushFabric::new(Arc::new(OpenAuth), config);
        let mut sub = fabric.subscribe("u1", "anything").unwrap();
        let mut other = fabric.subscribe("u1", "anything").unwrap();

        // Fill well past the slow subscriber's capacity while the healthy
        // subscriber keeps draining.
        for _ in 0..10 {
            fabric
                .publish(
                    "u1",
                    &TurnEvent::Content {
                        text: "chunk".to_string(),
                    },
                )
                .await;
            let _ = other.try_next_event();
        }

        // The slow subscriber sees its queued events, then the terminal
        // backpressure error, then the closed channel.
        let mut kinds = Vec::new();
        while let Some(envelope) = sub.next_event().await {
            kinds.push(envelope.event.kind());
        }
        assert_eq!(kinds.last().copied(), Some("error"));
        assert_eq!(fabric.subscription_count("u1"), 1);

        // The other subscriber keeps receiving afterwards.
        fabric.publish("u1", &TurnEvent::Pong).await;
        let mut saw_pong = false;
        while let Some(envelope) = other.try_next_event() {
            if envelope.event.kind() == "pong" {
                saw_pong = true;
            }
        }
        assert!(saw_pong);
    }

    #[tokio::test]
    async fn test_heartbeat_answers_pong_on_that_subscription_only() {
        let fabric = PushFabric::new(Arc::new(OpenAuth), PushConfig::default());
        let mut a = fabric.subscribe("u1", "x").unwrap();
        let mut b = fabric.subscribe("u1", "x").unwrap();

        fabric.heartbeat("u1", &a.id).await;

        assert_eq!(
            a.try_next_event().map(|e| e.event.kind()),
            Some("pong")
        );
        assert!(b.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_idle_subscriptions_are_reaped() {
        let mut config = PushConfig::default();
        config.heartbeat_interval = Duration::from_millis(10);
        let fabric = PushFabric::new(Arc::new(OpenAuth), config);
        let _sub = fabric.subscribe("u1", "x").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fabric.reap_idle(), 1);
        assert_eq!(fabric.subscription_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_grace_window_rejects_late_authentication() {
        let mut config = PushConfig::default();
        config.auth_grace = Duration::from_millis(5);
        let fabric = PushFabric::new(Arc::new(OpenAuth), config);

        let pending = fabric.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            pending.authenticate("u1", "x"),
            Err(PushError::GraceExpired)
        ));
    }
}
