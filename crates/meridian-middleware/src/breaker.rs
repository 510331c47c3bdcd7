//! Per-route circuit breakers.
//!
//! ```text
//! closed    --(consecutive failures > max_failures)-->   open
//! open      --(open_wait elapsed)-->                      half-open
//! half-open --(consecutive successes > max_successes)--> closed
//! half-open --(any failure)-->                            open
//! ```
//!
//! Transitions happen under the entry's mutex; counters are atomics so
//! admin listings can read them without taking the lock.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Trial requests are admitted by the half-open policy.
    HalfOpen,
    /// Requests are rejected.
    Open,
}

impl BreakerState {
    /// The state name as used in the admin API.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`BreakerState`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown breaker state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for BreakerState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "closed" => Ok(Self::Closed),
            "half-open" | "halfopen" | "half_open" => Ok(Self::HalfOpen),
            "open" => Ok(Self::Open),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// Decides whether a half-open breaker admits a trial request.
///
/// Receives the time of the previous admission, if any.
pub type HalfOpenPolicy = Arc<dyn Fn(Option<Instant>, Instant) -> bool + Send + Sync>;

/// Admits one request per `interval`.
#[must_use]
pub fn one_per_interval(interval: Duration) -> HalfOpenPolicy {
    Arc::new(move |last, now| last.map_or(true, |last| now.duration_since(last) >= interval))
}

/// Breaker thresholds.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated while closed.
    pub max_failures: u64,
    /// Consecutive successes required to close from half-open.
    pub max_successes: u64,
    /// Time spent open before trying half-open.
    pub open_wait: Duration,
    /// Admission policy while half-open.
    pub half_open: HalfOpenPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            max_successes: 2,
            open_wait: Duration::from_secs(10),
            half_open: one_per_interval(Duration::from_secs(1)),
        }
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("max_failures", &self.max_failures)
            .field("max_successes", &self.max_successes)
            .field("open_wait", &self.open_wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Transition {
    state: BreakerState,
    since: Instant,
    since_wall: SystemTime,
    last_admitted: Option<Instant>,
    generation: u64,
}

/// One route's breaker.
#[derive(Debug)]
pub struct Breaker {
    name: String,
    inner: Mutex<Transition>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    consecutive_failures: AtomicU64,
}

/// Serializable view of a breaker for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Route name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Wall-clock time of the last transition (RFC 3339).
    pub last_transition: String,
    /// Successful requests since creation.
    pub total_successes: u64,
    /// Failed requests since creation.
    pub total_failures: u64,
    /// Current success streak.
    pub consecutive_successes: u64,
    /// Current failure streak.
    pub consecutive_failures: u64,
}

/// Outcome of [`Breaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the request.
    Allowed,
    /// Reject with 503.
    Rejected(BreakerState),
}

impl Breaker {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Transition {
                state: BreakerState::Closed,
                since: Instant::now(),
                since_wall: SystemTime::now(),
                last_admitted: None,
                generation: 0,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// The route name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn transition(&self, t: &mut Transition, to: BreakerState) {
        if t.state == to {
            return;
        }
        tracing::info!(route = %self.name, from = %t.state, to = %to, "circuit breaker transition");
        metrics::counter!(
            "meridian_breaker_transitions_total",
            "route" => self.name.clone(),
            "state" => to.as_str()
        )
        .increment(1);
        t.state = to;
        t.since = Instant::now();
        t.since_wall = SystemTime::now();
        t.last_admitted = None;
        t.generation += 1;
        match to {
            BreakerState::Open => self.consecutive_successes.store(0, Ordering::Relaxed),
            BreakerState::Closed => self.consecutive_failures.store(0, Ordering::Relaxed),
            BreakerState::HalfOpen => {
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Decides whether a request may run.
    pub fn admit(&self, config: &BreakerConfig) -> Admission {
        let mut t = self.inner.lock();
        let now = Instant::now();
        if t.state == BreakerState::Open && now.duration_since(t.since) >= config.open_wait {
            self.transition(&mut t, BreakerState::HalfOpen);
        }
        match t.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => Admission::Rejected(BreakerState::Open),
            BreakerState::HalfOpen => {
                if (config.half_open)(t.last_admitted, now) {
                    t.last_admitted = Some(now);
                    Admission::Allowed
                } else {
                    Admission::Rejected(BreakerState::HalfOpen)
                }
            }
        }
    }

    /// Records a successful request.
    pub fn on_success(&self, config: &BreakerConfig) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut t = self.inner.lock();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let streak = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if t.state == BreakerState::HalfOpen && streak > config.max_successes {
            self.transition(&mut t, BreakerState::Closed);
        }
    }

    /// Records a failed request. Returns `true` if the breaker opened.
    pub fn on_failure(&self, config: &BreakerConfig) -> bool {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut t = self.inner.lock();
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let open = match t.state {
            BreakerState::Closed => streak > config.max_failures,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if open {
            self.transition(&mut t, BreakerState::Open);
        }
        open
    }

    /// Forces a state.
    pub fn force(&self, state: BreakerState) {
        let mut t = self.inner.lock();
        self.transition(&mut t, state);
    }

    fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    fn half_open_if(&self, generation: u64) {
        let mut t = self.inner.lock();
        if t.state == BreakerState::Open && t.generation == generation {
            self.transition(&mut t, BreakerState::HalfOpen);
        }
    }

    /// Admin view.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let t = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: t.state,
            last_transition: chrono::DateTime::<chrono::Utc>::from(t.since_wall).to_rfc3339(),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide table of breakers keyed by route name.
#[derive(Debug, Clone, Default)]
pub struct BreakerStore {
    config: Arc<BreakerConfig>,
    entries: Arc<DashMap<String, Arc<Breaker>>>,
}

impl BreakerStore {
    /// Creates a store whose breakers share `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            entries: Arc::new(DashMap::new()),
        }
    }

    /// The shared thresholds.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns the breaker for `name`, creating a closed one.
    pub fn get_or_create(&self, name: &str) -> Arc<Breaker> {
        if let Some(entry) = self.entries.get(name) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Breaker::new(name)))
                .value(),
        )
    }

    /// Returns the breaker for `name`, if one exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Breaker>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Decides whether a request on `name` may run.
    pub fn admit(&self, name: &str) -> Admission {
        self.get_or_create(name).admit(&self.config)
    }

    /// Records the outcome of a request on `name`.
    ///
    /// When this opens the breaker and a runtime is available, a timer task
    /// moves it to half-open after `open_wait`.
    pub fn record(&self, name: &str, success: bool) {
        let breaker = self.get_or_create(name);
        if success {
            breaker.on_success(&self.config);
        } else if breaker.on_failure(&self.config) {
            self.schedule_half_open(&breaker);
        }
    }

    fn schedule_half_open(&self, breaker: &Arc<Breaker>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let breaker = Arc::clone(breaker);
        let generation = breaker.generation();
        let wait = self.config.open_wait;
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            breaker.half_open_if(generation);
        });
    }

    /// Forces the state of `name`, creating the breaker if needed.
    pub fn force(&self, name: &str, state: BreakerState) {
        let breaker = self.get_or_create(name);
        breaker.force(state);
        if state == BreakerState::Open {
            self.schedule_half_open(&breaker);
        }
    }

    /// Snapshots of all breakers sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            max_successes: 1,
            open_wait: Duration::from_secs(5),
            half_open: one_per_interval(Duration::from_millis(100)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let store = BreakerStore::new(config());
        for _ in 0..3 {
            assert_eq!(store.admit("r"), Admission::Allowed);
            store.record("r", false);
        }
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Closed);

        store.record("r", false);
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Open);
        assert_eq!(store.admit("r"), Admission::Rejected(BreakerState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let store = BreakerStore::new(config());
        for _ in 0..3 {
            store.record("r", false);
        }
        store.record("r", true);
        store.record("r", false);
        let snap = store.get("r").unwrap().snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.total_failures, 4);
        assert_eq!(snap.total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_moves_to_half_open() {
        let store = BreakerStore::new(config());
        store.force("r", BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get("r").unwrap().state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admission_and_recovery() {
        let store = BreakerStore::new(config());
        store.force("r", BreakerState::HalfOpen);

        assert_eq!(store.admit("r"), Admission::Allowed);
        assert_eq!(store.admit("r"), Admission::Rejected(BreakerState::HalfOpen));
        store.record("r", true);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(store.admit("r"), Admission::Allowed);
        store.record("r", true);
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let store = BreakerStore::new(config());
        store.force("r", BreakerState::HalfOpen);
        assert_eq!(store.admit("r"), Admission::Allowed);
        store.record("r", false);
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_reopen_cycle() {
        let store = BreakerStore::new(config());
        store.force("r", BreakerState::Open);
        store.force("r", BreakerState::Closed);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.get("r").unwrap().state(), BreakerState::Closed);
    }

    #[test]
    fn test_state_parse_and_serde() {
        assert_eq!("half-open".parse::<BreakerState>().unwrap(), BreakerState::HalfOpen);
        assert_eq!("OPEN".parse::<BreakerState>().unwrap(), BreakerState::Open);
        assert!("ajar".parse::<BreakerState>().is_err());
        assert_eq!(
            serde_json::to_string(&BreakerState::HalfOpen).unwrap(),
            "\"half-open\""
        );
    }

    #[test]
    fn test_snapshots_sorted() {
        let store = BreakerStore::new(config());
        store.get_or_create("b");
        store.get_or_create("a");
        let names: Vec<_> = store.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
