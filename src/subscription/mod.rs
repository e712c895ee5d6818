//! The subscription registry and per-subscription change detection (§4.3,
//! §4.4).
//!
//! A [`Subscription`] is a standing SPARQL query plus the last serialized
//! result it produced; [`SubscriptionRegistry`] maps fingerprints to
//! subscriptions and preserves insertion order so `notify_all()` schedules
//! re-evaluations in the order subscriptions were created (§4.6).
//!
//! Each subscription is individually `Rc<RefCell<..>>`-wrapped rather than
//! living behind one registry-wide lock: `reevaluate_shared` below never
//! holds a borrow across an `.await`, so two independent subscriptions'
//! re-evaluations can genuinely interleave on the single-threaded event
//! loop without ever contending for the same `RefCell` (§5).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::RdfBackend;
use crate::prefix::PrefixRegistry;

/// Compute the subscription fingerprint: hex MD5 of the exact payload
/// bytes, lowercase, 32 characters.
pub fn fingerprint(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

/// One CoAP Observe registration: the identity used for set membership
/// (§3's "host:port" hostinfo), the address notifications are sent to, and
/// the token the client must see echoed back (RFC 7641).
#[derive(Debug, Clone)]
pub struct ObserverEntry {
    pub identity: String,
    pub addr: SocketAddr,
    pub token: Vec<u8>,
}

/// Outcome of removing an observer identity from a subscription.
#[derive(Debug, PartialEq, Eq)]
pub enum Deregistration {
    /// The caller was never an observer: deregistration is forbidden.
    NotObserving,
    /// The caller was removed; other observers remain.
    StillObserved,
    /// The caller was the last observer; the subscription should be torn
    /// down by the registry.
    LastObserverRemoved,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub sparql: String,
    pub clients: usize,
}

pub struct Subscription {
    sparql: String,
    prefixed_sparql: String,
    last_result: Vec<u8>,
    observers: Vec<ObserverEntry>,
    /// Monotonic CoAP Observe sequence counter, incremented on every
    /// published change (RFC 7641 §3.2).
    observe_seq: u32,
    /// Counter of pending notifications (§4.4): incremented once per
    /// re-evaluation scheduled for this subscription, and handed to that
    /// re-evaluation as its generation number. `committed_generation`
    /// tracks the highest generation that has actually written
    /// `last_result`, so a re-evaluation that completes after a newer one
    /// already committed is recognized as stale and discarded rather than
    /// overwriting a fresher result (§5's ordering guarantee).
    pending_generation: u64,
    committed_generation: u64,
}

pub type SharedSubscription = Rc<RefCell<Subscription>>;

impl Subscription {
    /// Construct a subscription and compute its initial `last_result` by
    /// running the *unprefixed* SPARQL text against the backend, before any
    /// observer exists (§4.4).
    async fn new(
        sparql: String,
        prefixed_sparql: String,
        backend: &dyn RdfBackend,
    ) -> Result<Self, crate::backend::BackendError> {
        let last_result = backend.query(&sparql).await?;
        Ok(Self {
            sparql,
            prefixed_sparql,
            last_result,
            observers: Vec::new(),
            observe_seq: 0,
            pending_generation: 0,
            committed_generation: 0,
        })
    }

    pub fn sparql(&self) -> &str {
        &self.sparql
    }

    pub fn last_result(&self) -> &[u8] {
        &self.last_result
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn observe_seq(&self) -> u32 {
        self.observe_seq
    }

    /// Reserve the next generation number for a re-evaluation about to be
    /// scheduled. Must be called synchronously at scheduling time (before
    /// the re-evaluation's backend query is awaited), so that concurrent
    /// re-evaluations are assigned generations in the order their
    /// triggering updates were applied (§4.6).
    pub fn next_generation(&mut self) -> u64 {
        self.pending_generation += 1;
        self.pending_generation
    }

    /// Idempotent insertion: returns `true` if `identity` was newly added.
    pub fn register_observer(&mut self, identity: &str, addr: SocketAddr, token: Vec<u8>) -> bool {
        if self.observers.iter().any(|o| o.identity == identity) {
            false
        } else {
            self.observers.push(ObserverEntry {
                identity: identity.to_string(),
                addr,
                token,
            });
            true
        }
    }

    pub fn deregister_observer(&mut self, identity: &str) -> Deregistration {
        let Some(pos) = self.observers.iter().position(|o| o.identity == identity) else {
            return Deregistration::NotObserving;
        };
        self.observers.remove(pos);
        if self.observers.is_empty() {
            Deregistration::LastObserverRemoved
        } else {
            Deregistration::StillObserved
        }
    }
}

/// Re-run one subscription's `prefixed_sparql` and, if its result changed,
/// commit the new bytes and return them along with a snapshot of its
/// current observers. The `RefCell` borrow used to read `prefixed_sparql`
/// and the one used to commit the result are each held only across
/// synchronous code, never across the `backend.query` await (§5).
///
/// `generation` must have been reserved with [`Subscription::next_generation`]
/// at scheduling time, before this re-evaluation's backend query started.
/// Two re-evaluations of the same subscription can race an independent
/// HTTP round-trip (§5) and finish out of order; comparing `generation`
/// against the subscription's `committed_generation` lets the one that
/// finishes *last* still be recognized as stale if a newer generation
/// already committed, so `last_result` never goes backward.
pub async fn reevaluate_shared(
    subscription: &SharedSubscription,
    backend: &dyn RdfBackend,
    generation: u64,
) -> Option<(Vec<u8>, u32, Vec<ObserverEntry>)> {
    let prefixed_sparql = subscription.borrow().prefixed_sparql.clone();
    let new_result = match backend.query(&prefixed_sparql).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("subscription re-evaluation failed: {}", e);
            return None;
        }
    };

    let mut sub = subscription.borrow_mut();
    if generation < sub.committed_generation {
        debug!(
            "discarding stale re-evaluation (generation {} superseded by {})",
            generation, sub.committed_generation
        );
        return None;
    }
    sub.committed_generation = generation;

    if new_result == sub.last_result {
        None
    } else {
        sub.last_result = new_result.clone();
        sub.observe_seq = sub.observe_seq.wrapping_add(1);
        debug!("subscription result changed, seq={}", sub.observe_seq);
        Some((new_result, sub.observe_seq, sub.observers.clone()))
    }
}

/// Map from fingerprint to subscription, insertion-ordered.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: IndexMap<String, SharedSubscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: IndexMap::new(),
        }
    }

    pub fn info(&self, fingerprint: &str) -> Option<SubscriptionInfo> {
        self.subscriptions.get(fingerprint).map(|s| {
            let s = s.borrow();
            SubscriptionInfo {
                sparql: s.sparql().to_string(),
                clients: s.observer_count(),
            }
        })
    }

    /// A cheap clone of the `Rc` handle, for callers that need to act on
    /// the subscription outside the registry's own borrow (e.g. across an
    /// `.await`).
    pub fn get(&self, fingerprint: &str) -> Option<SharedSubscription> {
        self.subscriptions.get(fingerprint).cloned()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.subscriptions.contains_key(fingerprint)
    }

    /// Remove a subscription. Idempotent: removing an already-absent
    /// fingerprint simply returns `false`.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        let removed = self.subscriptions.shift_remove(fingerprint).is_some();
        if removed {
            info!("removed subscription {}", fingerprint);
        }
        removed
    }

    /// Fingerprints in insertion order, for `notify_all()` scheduling and
    /// for rendering `.well-known/core`.
    pub fn fingerprints(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Compute the fingerprint of `payload`; if no subscription exists yet for
/// it, create one (running its SPARQL once against `backend`). Returns
/// `(fingerprint, created)`.
///
/// Takes `&RefCell<SubscriptionRegistry>` rather than `&mut SubscriptionRegistry`
/// so the initial query's `backend.query().await` — a real HTTP round-trip
/// for the remote backends — never runs while the registry is held
/// borrowed: a `notify_all` re-evaluation task spawned by a prior update
/// can be polled while this await is suspended, and it only ever takes a
/// shared `borrow()` on the registry (§5). Mirrors the discipline
/// `reevaluate_shared` already follows.
pub async fn get_or_create(
    registry: &RefCell<SubscriptionRegistry>,
    payload: &[u8],
    prefixes: &PrefixRegistry,
    backend: &dyn RdfBackend,
) -> Result<(String, bool), crate::backend::BackendError> {
    let fp = fingerprint(payload);
    if registry.borrow().contains(&fp) {
        debug!("reusing existing subscription {}", fp);
        return Ok((fp, false));
    }

    let sparql = String::from_utf8_lossy(payload).into_owned();
    let prefixed_sparql = prefixes.prepend_sparql(&sparql);
    let subscription = Subscription::new(sparql, prefixed_sparql, backend).await?;

    // A second request for the same payload may have raced this one while
    // the initial query was in flight; don't clobber whatever it created.
    let mut reg = registry.borrow_mut();
    if reg.contains(&fp) {
        debug!("reusing existing subscription {} (raced with a concurrent create)", fp);
        return Ok((fp, false));
    }
    reg.subscriptions.insert(fp.clone(), Rc::new(RefCell::new(subscription)));
    info!("created subscription {}", fp);
    Ok((fp, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalGraphBackend;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_fingerprint_is_stable_hex_md5() {
        let payload = b"SELECT * WHERE { ?s ?p ?o }";
        let fp1 = fingerprint(payload);
        let fp2 = fingerprint(payload);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 32);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_distinct_payloads_yield_distinct_fingerprints() {
        assert_ne!(
            fingerprint(b"SELECT ?s WHERE { ?s ?p ?o }"),
            fingerprint(b"SELECT ?p WHERE { ?s ?p ?o }")
        );
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_subscription_for_identical_payload() {
        let backend = LocalGraphBackend::new().unwrap();
        let prefixes = PrefixRegistry::empty();
        let registry = RefCell::new(SubscriptionRegistry::new());
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";

        let (fp1, created1) = get_or_create(&registry, payload, &prefixes, &backend).await.unwrap();
        assert!(created1);
        let (fp2, created2) = get_or_create(&registry, payload, &prefixes, &backend).await.unwrap();
        assert!(!created2);
        assert_eq!(fp1, fp2);
        assert_eq!(registry.borrow().len(), 1);
    }

    fn bare_subscription() -> Subscription {
        Subscription {
            sparql: "SELECT * WHERE { ?s ?p ?o }".to_string(),
            prefixed_sparql: "SELECT * WHERE { ?s ?p ?o }".to_string(),
            last_result: Vec::new(),
            observers: Vec::new(),
            observe_seq: 0,
            pending_generation: 0,
            committed_generation: 0,
        }
    }

    #[test]
    fn test_observer_registration_is_idempotent() {
        let sub = Rc::new(RefCell::new(bare_subscription()));
        assert!(sub.borrow_mut().register_observer("127.0.0.1:5001", test_addr(5001), vec![1]));
        assert!(!sub.borrow_mut().register_observer("127.0.0.1:5001", test_addr(5001), vec![1]));
        assert_eq!(sub.borrow().observer_count(), 1);
    }

    #[test]
    fn test_last_observer_removal_is_reported() {
        let mut sub = bare_subscription();
        sub.register_observer("a", test_addr(1), vec![0]);
        sub.register_observer("b", test_addr(2), vec![0]);
        assert_eq!(sub.deregister_observer("a"), Deregistration::StillObserved);
        assert_eq!(sub.deregister_observer("a"), Deregistration::NotObserving);
        assert_eq!(sub.deregister_observer("b"), Deregistration::LastObserverRemoved);
    }

    #[test]
    fn test_next_generation_is_monotonic() {
        let mut sub = bare_subscription();
        assert_eq!(sub.next_generation(), 1);
        assert_eq!(sub.next_generation(), 2);
        assert_eq!(sub.next_generation(), 3);
    }

    #[tokio::test]
    async fn test_reevaluate_detects_byte_diff_only() {
        let backend = LocalGraphBackend::new().unwrap();
        let prefixes = PrefixRegistry::empty();
        let registry = RefCell::new(SubscriptionRegistry::new());
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";
        let (fp, _) = get_or_create(&registry, payload, &prefixes, &backend).await.unwrap();
        let shared = registry.borrow().get(&fp).unwrap();

        // No change yet: reevaluate should report nothing new.
        let gen1 = shared.borrow_mut().next_generation();
        assert!(reevaluate_shared(&shared, &backend, gen1).await.is_none());

        backend
            .update(
                "INSERT DATA { <http://a> <http://b> <http://c> }",
                crate::prefix::BodyFormat::Sparql,
            )
            .await
            .unwrap();

        let gen2 = shared.borrow_mut().next_generation();
        let changed = reevaluate_shared(&shared, &backend, gen2).await;
        assert!(changed.is_some());
        let (bytes, seq, _observers) = changed.unwrap();
        assert_eq!(shared.borrow().last_result(), bytes.as_slice());
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn test_reevaluate_discards_a_stale_generation_that_finishes_last() {
        let backend = LocalGraphBackend::new().unwrap();
        let prefixes = PrefixRegistry::empty();
        let registry = RefCell::new(SubscriptionRegistry::new());
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";
        let (fp, _) = get_or_create(&registry, payload, &prefixes, &backend).await.unwrap();
        let shared = registry.borrow().get(&fp).unwrap();

        // Two updates are applied back-to-back; both reservations happen
        // before either re-evaluation's backend query runs, as notify_all
        // does.
        let gen_u1 = shared.borrow_mut().next_generation();
        let gen_u2 = shared.borrow_mut().next_generation();

        backend
            .update(
                "INSERT DATA { <http://a> <http://b> <http://c> }",
                crate::prefix::BodyFormat::Sparql,
            )
            .await
            .unwrap();

        // The newer generation's re-evaluation (U2) completes first and
        // commits.
        let newer = reevaluate_shared(&shared, &backend, gen_u2).await;
        assert!(newer.is_some());
        let committed_after_u2 = shared.borrow().last_result().to_vec();

        // U1's re-evaluation finishes afterward against the same
        // (now-stale) generation. It must not overwrite U2's result, even
        // though it would otherwise look like a byte-identical re-run.
        let stale = reevaluate_shared(&shared, &backend, gen_u1).await;
        assert!(stale.is_none());
        assert_eq!(shared.borrow().last_result(), committed_after_u2.as_slice());
    }
}
