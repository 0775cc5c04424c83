//! Fixed-window request limiter.
//!
//! Each protected endpoint owns its own [`RateLimiter`] with its own window
//! length and ceiling. Counters are keyed by client identity (usually the
//! source address) and live in a process-wide map that a background task
//! sweeps at a fixed interval, independent of the window length.
//!
//! # Deployment note
//!
//! Counters are held in memory and are not shared across processes. Running
//! more than one relay instance behind a load balancer multiplies the
//! effective ceiling by the number of instances; enforcing a global limit
//! requires an external counter store.
//!
//! # Example
//!
//! ```rust,ignore
//! use realtime_relay::core::rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new("sessions", RateLimitPolicy::new(30, Duration::from_secs(300)));
//! limiter.start();
//!
//! match limiter.check("203.0.113.7") {
//!     RateLimitDecision::Allow => { /* handle request */ }
//!     RateLimitDecision::Throttle { retry_after_secs } => { /* reply 429 */ }
//! }
//!
//! limiter.stop();
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Window length and ceiling for one protected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per key inside one window
    pub max_requests: u32,
    /// Window length
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Policy with a five minute window.
    pub const fn per_five_minutes(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(300))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Outcome of a [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request is within the ceiling
    Allow,
    /// The request is over the ceiling; retry after the given number of seconds
    Throttle { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow)
    }
}

/// Counter state for one client key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_reset_at: Instant,
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-endpoint fixed-window limiter with a background expiry sweep.
///
/// The key map is a [`DashMap`], so the read-modify-write in [`check`](Self::check)
/// runs under the shard lock of the key and concurrent requests for the same
/// key cannot both slip under the ceiling.
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    sweep_interval: Duration,
    entries: Arc<DashMap<String, RateLimitEntry>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("sweep_interval", &self.sweep_interval)
            .field("tracked_keys", &self.entries.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter using [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new(name: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self::with_sweep_interval(name, policy, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a limiter with a custom sweep interval.
    ///
    /// A zero interval falls back to [`DEFAULT_SWEEP_INTERVAL`].
    pub fn with_sweep_interval(
        name: impl Into<String>,
        policy: RateLimitPolicy,
        sweep_interval: Duration,
    ) -> Self {
        let name = name.into();
        let sweep_interval = if sweep_interval.is_zero() {
            warn!(
                limiter = %name,
                fallback_secs = DEFAULT_SWEEP_INTERVAL.as_secs(),
                "Zero sweep interval, using default"
            );
            DEFAULT_SWEEP_INTERVAL
        } else {
            sweep_interval
        };

        Self {
            name,
            policy,
            sweep_interval,
            entries: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Count a request for `key` and decide whether it may proceed.
    ///
    /// Requests over the ceiling are rejected, never queued. The counter keeps
    /// increasing while throttled; it is reset only when the window elapses.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.policy.window;

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(RateLimitEntry {
                    count: 1,
                    window_reset_at: now + window,
                });
                self.decide(1, now + window, now)
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now >= entry.window_reset_at {
                    entry.count = 1;
                    entry.window_reset_at = now + window;
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
                self.decide(entry.count, entry.window_reset_at, now)
            }
        }
    }

    fn decide(&self, count: u32, window_reset_at: Instant, now: Instant) -> RateLimitDecision {
        if count <= self.policy.max_requests {
            return RateLimitDecision::Allow;
        }

        let remaining_ms = window_reset_at.saturating_duration_since(now).as_millis() as u64;
        RateLimitDecision::Throttle {
            retry_after_secs: remaining_ms.div_ceil(1000),
        }
    }

    /// Snapshot of the counter for `key`, if one exists.
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry whose window has already elapsed.
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries)
    }

    /// Start the background sweep task. Calling `start` twice is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let entries = Arc::clone(&self.entries);
        let interval = self.sweep_interval;
        let name = self.name.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep_expired(&entries);
                        if removed > 0 {
                            debug!(limiter = %name, removed, "Swept expired rate limit entries");
                        }
                    }
                }
            }
        });

        info!(
            limiter = %self.name,
            max_requests = self.policy.max_requests,
            window_secs = self.policy.window.as_secs(),
            "Rate limiter sweep started"
        );
        *sweeper = Some(Sweeper { token, handle });
    }

    /// Stop the background sweep task. Counters are kept.
    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.token.cancel();
            sweeper.handle.abort();
            info!(limiter = %self.name, "Rate limiter sweep stopped");
        }
    }

    /// Whether the sweep task is running.
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|sweeper| !sweeper.handle.is_finished())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.token.cancel();
            sweeper.handle.abort();
        }
    }
}

fn sweep_expired(entries: &DashMap<String, RateLimitEntry>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| entry.window_reset_at > now);
    before.saturating_sub(entries.len())
}
