use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;
use crate::core::rate_limit::RateLimiter;
use crate::core::relay::Relay;
use crate::errors::RelayResult;

/// Shared application state handed to every handler.
///
/// Each protected endpoint owns its own limiter; they never share counters.
#[derive(Debug)]
pub struct AppState {
    pub config: ServerConfig,
    pub relay: Relay,
    pub session_limiter: Arc<RateLimiter>,
    pub sessions_limiter: Arc<RateLimiter>,
    pub negotiate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> RelayResult<Arc<Self>> {
        let relay = Relay::from_config(&config)?;
        let sweep = config.rate_limit_sweep_interval;

        let session_limiter = Arc::new(RateLimiter::with_sweep_interval(
            "realtime_session",
            config.session_rate_limit,
            sweep,
        ));
        let sessions_limiter = Arc::new(RateLimiter::with_sweep_interval(
            "realtime_sessions",
            config.sessions_rate_limit,
            sweep,
        ));
        let negotiate_limiter = Arc::new(RateLimiter::with_sweep_interval(
            "realtime_negotiate",
            config.negotiate_rate_limit,
            sweep,
        ));

        Ok(Arc::new(Self {
            config,
            relay,
            session_limiter,
            sessions_limiter,
            negotiate_limiter,
        }))
    }

    fn limiters(&self) -> [&Arc<RateLimiter>; 3] {
        [
            &self.session_limiter,
            &self.sessions_limiter,
            &self.negotiate_limiter,
        ]
    }

    /// Start the background sweep of every endpoint limiter. Must be called
    /// from within a Tokio runtime.
    pub fn start_rate_limiters(&self) {
        for limiter in self.limiters() {
            limiter.start();
        }
        info!(
            sweep_interval_secs = self.config.rate_limit_sweep_interval.as_secs(),
            "Rate limiter sweeps started"
        );
    }

    pub fn stop_rate_limiters(&self) {
        for limiter in self.limiters() {
            limiter.stop();
        }
        info!("Rate limiter sweeps stopped");
    }
}
