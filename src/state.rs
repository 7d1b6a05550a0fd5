use std::sync::Arc;

use tokio::sync::{broadcast, Notify};

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::middleware::rate_limit::{EndpointRateLimiter, LimitedEndpoint};
use crate::storage::Storage;
use crate::types::LockEvent;

/// Capacity of the lock event channel; slow SSE subscribers skip what they missed.
const LOCK_EVENT_CAPACITY: usize = 256;

/// The shared application state.
///
/// Holds everything handlers, middleware and the background workers need. Cloning is cheap;
/// all members are reference counted.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool.
    pub db: sqlx::SqlitePool,
    /// The application configuration.
    pub config: Arc<AppConfig>,
    /// Operational counters.
    pub metrics: Metrics,
    /// The per-endpoint rate limiter.
    pub rate_limiter: EndpointRateLimiter,
    /// Upload storage below `storage.root`.
    pub storage: Storage,
    /// Lock and unlock notifications, fanned out to `/events/locks` subscribers.
    pub lock_events: broadcast::Sender<LockEvent>,
    /// Wakes the mail dispatcher after something was enqueued.
    pub mail_wakeup: Arc<Notify>,
}

impl AppState {
    /// Creates a new `AppState`.
    ///
    /// Endpoint limits come from the `rate_limit` config section and apply per client IP.
    pub fn new(db: sqlx::SqlitePool, config: AppConfig) -> Self {
        let rl = &config.rate_limit;
        let rate_limiter = EndpointRateLimiter::new([
            (LimitedEndpoint::Login, rl.login_per_minute, 60),
            (LimitedEndpoint::PasswordReset, rl.login_per_minute, 60),
            (LimitedEndpoint::Search, rl.search_per_minute, 60),
            (LimitedEndpoint::Upload, rl.upload_per_minute, 60),
        ]);
        let storage = Storage::new(config.storage.root.clone());
        let (lock_events, _) = broadcast::channel(LOCK_EVENT_CAPACITY);

        Self {
            db,
            config: Arc::new(config),
            metrics: Metrics::new(),
            rate_limiter,
            storage,
            lock_events,
            mail_wakeup: Arc::new(Notify::new()),
        }
    }

    /// Publishes a lock event; having no subscribers is fine.
    pub fn emit_lock_event(&self, event: LockEvent) {
        let _ = self.lock_events.send(event);
    }
}
