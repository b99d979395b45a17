//! # Wake Channel
//!
//! Best-effort LISTEN/NOTIFY bridge that wakes polling executors as soon
//! as new queue messages land. This is purely a latency optimization:
//! durable queue state remains the single source of delivery truth, so a
//! missed notification only delays discovery until the next poll.

use crate::config::NotificationSettings;
use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Publishes wake events after enqueue operations.
#[derive(Debug, Clone)]
pub struct NotifyPublisher {
    pool: PgPool,
    channel: String,
    debounce: Duration,
    last_wake: Arc<Mutex<Option<Instant>>>,
}

impl NotifyPublisher {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            debounce: Duration::ZERO,
            last_wake: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_settings(pool: PgPool, settings: &NotificationSettings) -> Self {
        Self {
            pool,
            channel: settings.wake_channel.clone(),
            debounce: Duration::from_millis(settings.wake_debounce_ms),
            last_wake: Arc::new(Mutex::new(None)),
        }
    }

    /// Fire a wake notification. Failures are logged and swallowed; lost
    /// work is impossible because consumers keep polling. Bursts within
    /// the debounce window collapse into one notification.
    pub async fn wake(&self, reason: &str) {
        if !self.debounce.is_zero() {
            let mut last = self.last_wake.lock();
            let now = Instant::now();
            if last.map_or(false, |at| now.duration_since(at) < self.debounce) {
                return;
            }
            *last = Some(now);
        }
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(reason)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!(channel = %self.channel, error = %e, "wake notification failed");
        }
    }
}

/// Listens on the wake channel and forwards events into a
/// `tokio::sync::Notify` the executor selects on.
pub struct NotifyListener {
    listener: PgListener,
    notify: Arc<Notify>,
}

impl NotifyListener {
    pub async fn connect(pool: &PgPool, channel: &str) -> Result<Self, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        debug!(channel = channel, "listening for wake notifications");
        Ok(Self {
            listener,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Wake handle to hand to consumers.
    pub fn handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Run the forwarding loop until cancelled. Connection errors back off
    /// briefly and resume; the listener reconnects internally.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = self.listener.recv() => match received {
                        Ok(_) => self.notify.notify_waiters(),
                        Err(e) => {
                            warn!(error = %e, "wake listener error; backing off");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        })
    }
}
