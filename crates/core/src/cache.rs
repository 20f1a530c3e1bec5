use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arsenal_common::{CacheConfig, CachePolicy, Fingerprint, InvokeError, Outcome, Termination};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::lock;
use crate::store::DiskStore;

pub type FlightResult = Result<Arc<Outcome>, InvokeError>;
type Waiter = Box<dyn FnOnce(&FlightResult) + Send>;

enum FlightPhase {
    Pending(Vec<Waiter>),
    Resolved(FlightResult),
}

struct FlightState {
    phase: Mutex<FlightPhase>,
    done: Condvar,
}

/// One in-flight production of an outcome. Duplicates join it instead
/// of spawning a second subprocess; the producer resolves it exactly
/// once and every waiter observes that result verbatim.
#[derive(Clone)]
pub struct Flight {
    state: Arc<FlightState>,
}

impl Flight {
    fn new() -> Self {
        Flight {
            state: Arc::new(FlightState {
                phase: Mutex::new(FlightPhase::Pending(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    /// Register a callback fired once with the result. Fires on the
    /// producer's thread, or immediately when already resolved.
    pub fn attach(&self, waiter: Waiter) {
        let mut phase = lock(&self.state.phase);
        match &mut *phase {
            FlightPhase::Pending(waiters) => waiters.push(waiter),
            FlightPhase::Resolved(result) => {
                let result = result.clone();
                drop(phase);
                waiter(&result);
            }
        }
    }

    pub fn wait(&self, deadline: Option<Instant>) -> FlightResult {
        let mut phase = lock(&self.state.phase);
        loop {
            if let FlightPhase::Resolved(result) = &*phase {
                return result.clone();
            }
            match deadline {
                None => {
                    phase = self
                        .state
                        .done
                        .wait(phase)
                        .unwrap_or_else(|err| err.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(InvokeError::DeadlineExceeded);
                    }
                    let (guard, _) = self
                        .state
                        .done
                        .wait_timeout(phase, deadline - now)
                        .unwrap_or_else(|err| err.into_inner());
                    phase = guard;
                }
            }
        }
    }

    fn resolve(&self, result: FlightResult) {
        let waiters = {
            let mut phase = lock(&self.state.phase);
            match std::mem::replace(&mut *phase, FlightPhase::Resolved(result.clone())) {
                FlightPhase::Pending(waiters) => waiters,
                FlightPhase::Resolved(first) => {
                    // first resolution wins
                    *phase = FlightPhase::Resolved(first);
                    return;
                }
            }
        };
        self.state.done.notify_all();
        for waiter in waiters {
            waiter(&result);
        }
    }
}

/// Exclusive right to produce the outcome for one fingerprint. At most
/// one exists per fingerprint at a time. Dropping it unresolved, e.g.
/// when a queued invocation is cancelled before a worker picks it up,
/// releases the reservation and fails waiters with `cancelled`.
pub struct ProducerHandle {
    fingerprint: Fingerprint,
    flight: Flight,
    shared: Arc<Shared>,
    armed: bool,
}

impl ProducerHandle {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.shared.inner).flights.remove(&self.fingerprint);
        self.flight.resolve(Err(InvokeError::Cancelled));
        debug!(
            fingerprint = %self.fingerprint.short(),
            "reservation released before publish"
        );
    }
}

/// What `reserve` handed back.
pub enum Lookup {
    /// Fresh stored entry.
    Hit(Arc<Outcome>),
    /// Another producer is already running this fingerprint.
    Join(Flight),
    /// Caller owns production now.
    Reserved(ProducerHandle),
}

/// Read-only probe, no reservation.
pub enum Probe {
    Hit(Arc<Outcome>),
    Pending(Flight),
    Miss,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub in_flight: usize,
}

struct Entry {
    outcome: Arc<Outcome>,
    stored_at: Instant,
    size: u64,
    negative: bool,
}

struct Inner {
    entries: LruCache<Fingerprint, Entry>,
    bytes: u64,
    flights: HashMap<Fingerprint, Flight>,
}

struct Shared {
    inner: Mutex<Inner>,
    config: CacheConfig,
    store: Option<DiskStore>,
}

/// Memoises outcomes by fingerprint: LRU over a byte budget, lazy TTL
/// expiry, single-flight reservations, optional disk persistence.
#[derive(Clone)]
pub struct ResultCache {
    shared: Arc<Shared>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> io::Result<Self> {
        let store = match &config.dir {
            Some(dir) => Some(DiskStore::open(dir)?),
            None => None,
        };
        let cache = ResultCache {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                    flights: HashMap::new(),
                }),
                config,
                store,
            }),
        };
        cache.warm();
        Ok(cache)
    }

    fn warm(&self) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let outcomes = store.load_all();
        if outcomes.is_empty() {
            return;
        }
        let mut inner = lock(&self.shared.inner);
        for outcome in outcomes {
            let negative = outcome.termination != Termination::Exited;
            if negative && !self.shared.config.negative {
                store.remove(&outcome.fingerprint);
                continue;
            }
            let size = outcome.size_bytes();
            let entry = Entry {
                outcome: Arc::new(outcome.clone()),
                stored_at: Instant::now(),
                size,
                negative,
            };
            if let Some(prev) = inner.entries.put(outcome.fingerprint.clone(), entry) {
                inner.bytes -= prev.size;
            }
            inner.bytes += size;
        }
        Self::evict_over_budget(&mut inner, &self.shared.config, self.shared.store.as_ref());
        info!(
            entries = inner.entries.len(),
            bytes = inner.bytes,
            "cache warmed from disk store"
        );
    }

    /// The single-flight primitive. Atomically returns a fresh stored
    /// entry, the in-flight producer to join, or a new reservation.
    /// `bypass` skips stored entries but still joins a producer;
    /// `refresh` invalidates any stored entry first.
    pub fn reserve(&self, fingerprint: Fingerprint, policy: CachePolicy) -> Lookup {
        let mut inner = lock(&self.shared.inner);

        if policy == CachePolicy::Refresh {
            if let Some(entry) = inner.entries.pop(&fingerprint) {
                inner.bytes -= entry.size;
                if let Some(store) = &self.shared.store {
                    store.remove(&fingerprint);
                }
                debug!(fingerprint = %fingerprint.short(), "refresh invalidated stored entry");
            }
        }

        if policy == CachePolicy::Use {
            if let Some(outcome) = Self::fresh_hit(
                &mut inner,
                &self.shared.config,
                self.shared.store.as_ref(),
                &fingerprint,
            ) {
                return Lookup::Hit(outcome);
            }
        }

        if let Some(flight) = inner.flights.get(&fingerprint) {
            return Lookup::Join(flight.clone());
        }

        let flight = Flight::new();
        inner.flights.insert(fingerprint.clone(), flight.clone());
        Lookup::Reserved(ProducerHandle {
            fingerprint,
            flight,
            shared: self.shared.clone(),
            armed: true,
        })
    }

    pub fn lookup(&self, fingerprint: &Fingerprint, policy: CachePolicy) -> Probe {
        let mut inner = lock(&self.shared.inner);
        if policy == CachePolicy::Use {
            if let Some(outcome) = Self::fresh_hit(
                &mut inner,
                &self.shared.config,
                self.shared.store.as_ref(),
                fingerprint,
            ) {
                return Probe::Hit(outcome);
            }
        }
        match inner.flights.get(fingerprint) {
            Some(flight) => Probe::Pending(flight.clone()),
            None => Probe::Miss,
        }
    }

    /// Resolves every waiter with the outcome, releases the
    /// reservation and installs an entry when the outcome is cacheable
    /// under policy: successes always, failures only with negative
    /// caching on, cancellations never.
    pub fn publish(&self, mut handle: ProducerHandle, outcome: Outcome) -> Arc<Outcome> {
        handle.armed = false;
        let outcome = Arc::new(outcome);
        let cacheable = match outcome.termination {
            Termination::Exited => true,
            Termination::Cancelled => false,
            Termination::Timeout | Termination::Killed | Termination::SpawnError => {
                self.shared.config.negative
            }
        };

        {
            let mut inner = lock(&self.shared.inner);
            inner.flights.remove(&handle.fingerprint);
            if cacheable {
                let size = outcome.size_bytes();
                let entry = Entry {
                    outcome: outcome.clone(),
                    stored_at: Instant::now(),
                    size,
                    negative: outcome.termination != Termination::Exited,
                };
                if let Some(prev) = inner.entries.put(handle.fingerprint.clone(), entry) {
                    inner.bytes -= prev.size;
                }
                inner.bytes += size;
                Self::evict_over_budget(&mut inner, &self.shared.config, self.shared.store.as_ref());
            }
        }

        if cacheable {
            if let Some(store) = &self.shared.store {
                if let Err(err) = store.save(&outcome) {
                    warn!(
                        fingerprint = %handle.fingerprint.short(),
                        "disk store write failed: {}",
                        err
                    );
                }
            }
        }

        handle.flight.resolve(Ok(outcome.clone()));
        outcome
    }

    /// Resolves every waiter with the error; no entry is installed.
    pub fn abandon(&self, mut handle: ProducerHandle, error: InvokeError) {
        handle.armed = false;
        lock(&self.shared.inner).flights.remove(&handle.fingerprint);
        handle.flight.resolve(Err(error));
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock(&self.shared.inner);
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            in_flight: inner.flights.len(),
        }
    }

    fn fresh_hit(
        inner: &mut Inner,
        config: &CacheConfig,
        store: Option<&DiskStore>,
        fingerprint: &Fingerprint,
    ) -> Option<Arc<Outcome>> {
        let expired = match inner.entries.peek(fingerprint) {
            Some(entry) => {
                let ttl_ms = if entry.negative {
                    config.negative_ttl_ms
                } else {
                    config.entry_ttl_ms
                };
                ttl_ms > 0 && entry.stored_at.elapsed() >= Duration::from_millis(ttl_ms)
            }
            None => return None,
        };
        if expired {
            if let Some(entry) = inner.entries.pop(fingerprint) {
                inner.bytes -= entry.size;
            }
            if let Some(store) = store {
                store.remove(fingerprint);
            }
            debug!(fingerprint = %fingerprint.short(), "entry past ttl, treated as miss");
            return None;
        }
        inner.entries.get(fingerprint).map(|entry| entry.outcome.clone())
    }

    fn evict_over_budget(inner: &mut Inner, config: &CacheConfig, store: Option<&DiskStore>) {
        while inner.bytes > config.bytes_budget {
            match inner.entries.pop_lru() {
                Some((fingerprint, entry)) => {
                    inner.bytes -= entry.size;
                    if let Some(store) = store {
                        store.remove(&fingerprint);
                    }
                    debug!(
                        fingerprint = %fingerprint.short(),
                        freed = entry.size,
                        "evicted over byte budget"
                    );
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use arsenal_common::StreamCapture;
    use chrono::Utc;

    use super::*;

    fn outcome_with(tag: &str, stdout_len: usize, termination: Termination) -> Outcome {
        let now = Utc::now();
        Outcome {
            fingerprint: Fingerprint::from_hex(format!("{:0<64}", tag)),
            tool: "echo".into(),
            exit_code: Some(0),
            termination,
            signal: None,
            stdout: StreamCapture {
                bytes: vec![b'x'; stdout_len],
                truncated: false,
            },
            stderr: StreamCapture::default(),
            started_at: now,
            ended_at: now,
            duration_ms: 1,
            peak_rss_kb: None,
        }
    }

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::from_hex(format!("{:0<64}", tag))
    }

    fn reserved(cache: &ResultCache, tag: &str) -> ProducerHandle {
        match cache.reserve(fp(tag), CachePolicy::Use) {
            Lookup::Reserved(handle) => handle,
            _ => panic!("expected a reservation for {}", tag),
        }
    }

    #[test]
    fn publish_then_hit() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let handle = reserved(&cache, "a1");
        cache.publish(handle, outcome_with("a1", 8, Termination::Exited));

        match cache.reserve(fp("a1"), CachePolicy::Use) {
            Lookup::Hit(outcome) => assert_eq!(outcome.stdout.len(), 8),
            _ => panic!("expected a hit"),
        }
    }

    #[test]
    fn second_reserve_joins_the_flight() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let producer = reserved(&cache, "b2");

        let flight = match cache.reserve(fp("b2"), CachePolicy::Use) {
            Lookup::Join(flight) => flight,
            _ => panic!("expected to join"),
        };

        cache.publish(producer, outcome_with("b2", 4, Termination::Exited));
        let result = flight.wait(None).expect("flight result");
        assert_eq!(result.stdout.len(), 4);
    }

    #[test]
    fn bypass_skips_entries_but_joins_producers() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let handle = reserved(&cache, "c3");
        cache.publish(handle, outcome_with("c3", 4, Termination::Exited));

        // stored entry is ignored: bypass reserves a fresh flight
        let producer = match cache.reserve(fp("c3"), CachePolicy::Bypass) {
            Lookup::Reserved(handle) => handle,
            _ => panic!("bypass should miss the stored entry"),
        };

        // but a concurrent bypass joins the producer it finds
        match cache.reserve(fp("c3"), CachePolicy::Bypass) {
            Lookup::Join(_) => {}
            _ => panic!("bypass should join the in-flight producer"),
        }
        cache.abandon(producer, InvokeError::Cancelled);
    }

    #[test]
    fn refresh_invalidates_before_reserving() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let handle = reserved(&cache, "d4");
        cache.publish(handle, outcome_with("d4", 4, Termination::Exited));

        match cache.reserve(fp("d4"), CachePolicy::Refresh) {
            Lookup::Reserved(handle) => cache.abandon(handle, InvokeError::Cancelled),
            _ => panic!("refresh should reserve"),
        }
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn abandon_resolves_waiters_with_the_error() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let producer = reserved(&cache, "e5");
        let flight = match cache.reserve(fp("e5"), CachePolicy::Use) {
            Lookup::Join(flight) => flight,
            _ => panic!("expected to join"),
        };

        cache.abandon(producer, InvokeError::Overloaded("queue full".into()));
        assert_eq!(
            flight.wait(None).unwrap_err().kind(),
            "overloaded"
        );

        // reservation released: the fingerprint can run again
        match cache.reserve(fp("e5"), CachePolicy::Use) {
            Lookup::Reserved(_) => {}
            _ => panic!("expected a fresh reservation"),
        }
    }

    #[test]
    fn dropping_an_armed_handle_cancels_waiters() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let producer = reserved(&cache, "f6");
        let flight = match cache.reserve(fp("f6"), CachePolicy::Use) {
            Lookup::Join(flight) => flight,
            _ => panic!("expected to join"),
        };

        drop(producer);
        assert_eq!(flight.wait(None).unwrap_err().kind(), "cancelled");
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[test]
    fn failures_are_not_cached_without_negative() {
        let cache = ResultCache::new(CacheConfig::default()).expect("cache");
        let handle = reserved(&cache, "a7");
        cache.publish(handle, outcome_with("a7", 4, Termination::Timeout));
        assert_eq!(cache.stats().entries, 0);

        let mut config = CacheConfig::default();
        config.negative = true;
        let cache = ResultCache::new(config).expect("cache");
        let handle = reserved(&cache, "a7");
        cache.publish(handle, outcome_with("a7", 4, Termination::Timeout));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn cancelled_outcomes_are_never_cached() {
        let mut config = CacheConfig::default();
        config.negative = true;
        let cache = ResultCache::new(config).expect("cache");
        let handle = reserved(&cache, "b8");
        cache.publish(handle, outcome_with("b8", 4, Termination::Cancelled));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn lru_eviction_keeps_bytes_under_budget() {
        let unit = outcome_with("00", 100, Termination::Exited).size_bytes();
        let mut config = CacheConfig::default();
        config.bytes_budget = unit * 3;
        let cache = ResultCache::new(config).expect("cache");

        for tag in ["01", "02", "03"] {
            let handle = reserved(&cache, tag);
            cache.publish(handle, outcome_with(tag, 100, Termination::Exited));
        }
        assert_eq!(cache.stats().entries, 3);

        // touch 01 so 02 is the least recently used
        assert!(matches!(
            cache.reserve(fp("01"), CachePolicy::Use),
            Lookup::Hit(_)
        ));

        let handle = reserved(&cache, "04");
        cache.publish(handle, outcome_with("04", 100, Termination::Exited));

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert!(stats.bytes <= unit * 3);
        assert!(matches!(
            cache.lookup(&fp("02"), CachePolicy::Use),
            Probe::Miss
        ));
        assert!(matches!(
            cache.lookup(&fp("01"), CachePolicy::Use),
            Probe::Hit(_)
        ));
    }

    #[test]
    fn expired_entries_are_lazy_misses() {
        let mut config = CacheConfig::default();
        config.entry_ttl_ms = 30;
        let cache = ResultCache::new(config).expect("cache");
        let handle = reserved(&cache, "c9");
        cache.publish(handle, outcome_with("c9", 4, Termination::Exited));

        std::thread::sleep(Duration::from_millis(60));
        match cache.reserve(fp("c9"), CachePolicy::Use) {
            Lookup::Reserved(handle) => cache.abandon(handle, InvokeError::Cancelled),
            _ => panic!("expected a miss after ttl"),
        }
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn negative_entries_expire_on_their_own_ttl() {
        let mut config = CacheConfig::default();
        config.negative = true;
        config.negative_ttl_ms = 30;
        let cache = ResultCache::new(config).expect("cache");
        let handle = reserved(&cache, "d9");
        cache.publish(handle, outcome_with("d9", 4, Termination::Timeout));

        // fresh within the negative ttl
        assert!(matches!(
            cache.lookup(&fp("d9"), CachePolicy::Use),
            Probe::Hit(_)
        ));

        std::thread::sleep(Duration::from_millis(60));
        match cache.reserve(fp("d9"), CachePolicy::Use) {
            Lookup::Reserved(handle) => cache.abandon(handle, InvokeError::Cancelled),
            _ => panic!("expected a miss after the negative ttl"),
        }
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn disk_store_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = CacheConfig::default();
        config.dir = Some(dir.path().to_path_buf());

        {
            let cache = ResultCache::new(config.clone()).expect("cache");
            let handle = reserved(&cache, "d0");
            cache.publish(handle, outcome_with("d0", 16, Termination::Exited));
        }

        let cache = ResultCache::new(config).expect("cache");
        match cache.reserve(fp("d0"), CachePolicy::Use) {
            Lookup::Hit(outcome) => assert_eq!(outcome.stdout.len(), 16),
            _ => panic!("expected a warmed hit"),
        }
    }
}
