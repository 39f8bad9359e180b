//! Live tunneled connections, keyed by connection id.
//!
//! Every connection carries an expiry that only moves forward through
//! [`ConnectionRegistry::refresh`]. A background sweep closes and drops
//! connections whose expiry has passed.

pub mod event;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use event::serialize_timestamp;
pub use event::{EndpointEvent, EventLog, EventStatus};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a connection may go without a refresh.
    pub max_idle: Duration,
    /// Period of the eviction sweep.
    pub eviction_interval: Duration,
    /// Number of lifecycle events kept for the status dump.
    pub event_log_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(5 * 60),
            eviction_interval: Duration::from_secs(30),
            event_log_capacity: 1000,
        }
    }
}

struct Record {
    endpoint: Arc<Endpoint>,
    expires_at: Instant,
    destination: String,
    user: String,
    created_at: SystemTime,
}

/// Point-in-time view of one live connection.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub id: String,
    pub destination: String,
    pub user: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: SystemTime,
    #[serde(serialize_with = "serialize_timestamp")]
    pub expires_at: SystemTime,
}

struct Inner {
    records: DashMap<String, Record>,
    events: EventLog,
    max_idle: Duration,
    eviction_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the connection table. Clones refer to the same table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    /// Creates a registry without a background sweep; expired connections are
    /// only dropped by [`evict_expired`](Self::evict_expired).
    pub fn new(config: RegistryConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                events: EventLog::new(config.event_log_capacity),
                max_idle: config.max_idle,
                eviction_interval: config.eviction_interval,
                shutdown_tx,
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Creates a registry and starts its eviction sweep on the current
    /// runtime.
    pub fn start(config: RegistryConfig) -> Self {
        let registry = Self::new(config);
        let reaper = spawn_reaper(&registry.inner);
        *registry
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reaper);
        registry
    }

    pub fn max_idle(&self) -> Duration {
        self.inner.max_idle
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Registers an open endpoint and returns its fresh id.
    pub fn add(&self, endpoint: Endpoint, destination: impl Into<String>, user: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = Record {
            endpoint: Arc::new(endpoint),
            expires_at: Instant::now() + self.inner.max_idle,
            destination: destination.into(),
            user: user.into(),
            created_at: SystemTime::now(),
        };
        self.inner.records.insert(id.clone(), record);
        debug!(id = %id, "Registered connection");
        id
    }

    pub fn get_endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.inner
            .records
            .get(id)
            .map(|record| Arc::clone(&record.endpoint))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.records.contains_key(id)
    }

    /// Pushes the expiry of `id` out to `now + max_idle`.
    ///
    /// Returns `false` when no such connection is registered.
    pub fn refresh(&self, id: &str) -> bool {
        let Some(mut record) = self.inner.records.get_mut(id) else {
            return false;
        };
        // Expiry must strictly advance even when the clock has not.
        let next = Instant::now() + self.inner.max_idle;
        record.expires_at = next.max(record.expires_at + Duration::from_nanos(1));
        true
    }

    pub fn expires_at(&self, id: &str) -> Option<Instant> {
        self.inner.records.get(id).map(|record| record.expires_at)
    }

    /// Removes and closes `id`. Returns whether this call removed it.
    pub fn remove(&self, id: &str) -> bool {
        match self.inner.records.remove(id) {
            Some((_, record)) => {
                record.endpoint.close();
                debug!(id = %id, destination = %record.destination, "Removed connection");
                true
            }
            None => false,
        }
    }

    pub fn record_event(&self, id: &str, status: EventStatus, details: impl Into<String>) {
        self.inner.events.push(EndpointEvent::new(id, status, details));
    }

    pub fn events(&self) -> Vec<EndpointEvent> {
        self.inner.events.snapshot()
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut records: Vec<RecordSnapshot> = self
            .inner
            .records
            .iter()
            .map(|entry| RecordSnapshot {
                id: entry.key().clone(),
                destination: entry.destination.clone(),
                user: entry.user.clone(),
                created_at: entry.created_at,
                expires_at: wall + entry.expires_at.saturating_duration_since(now),
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Closes and drops every connection whose expiry has passed.
    ///
    /// A connection refreshed concurrently with the sweep is kept.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        // Collect first: removing while iterating would deadlock on the shard.
        let expired: Vec<String> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            let Some((id, record)) = self
                .inner
                .records
                .remove_if(&id, |_, record| record.expires_at <= now)
            else {
                continue;
            };

            record.endpoint.close();
            info!(id = %id, destination = %record.destination, "Closing idle connection");
            self.record_event(
                &id,
                EventStatus::Expire,
                format!(
                    "idle for more than {}",
                    humantime::format_duration(self.inner.max_idle)
                ),
            );
            evicted += 1;
        }
        evicted
    }

    /// Stops the sweep, then closes and drops every connection.
    pub async fn shutdown(&self) {
        info!("Connection registry shutting down...");
        self.inner.shutdown_tx.send_replace(true);

        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                warn!(error = %e, "Eviction task ended abnormally");
            }
        }

        let ids: Vec<String> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let closed = ids.iter().filter(|id| self.remove(id)).count();
        info!(closed, "Connection registry shut down");
    }
}

fn spawn_reaper(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let period = inner.eviction_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };
            let evicted = ConnectionRegistry { inner }.evict_expired();
            if evicted > 0 {
                debug!(evicted, "Eviction sweep finished");
            }
        }
        debug!("Eviction task stopped");
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn endpoint() -> Endpoint {
        let (local, _remote) = duplex(64);
        Endpoint::new(local, "test:1")
    }

    fn config(max_idle: Duration) -> RegistryConfig {
        RegistryConfig {
            max_idle,
            eviction_interval: Duration::from_secs(30),
            event_log_capacity: 16,
        }
    }

    #[tokio::test]
    async fn add_then_lookup() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let id = registry.add(endpoint(), "test:1", "alice");

        assert!(Uuid::parse_str(&id).is_ok());
        assert!(registry.get_endpoint(&id).is_some());
        assert_eq!(registry.len(), 1);

        let other = registry.add(endpoint(), "test:1", "alice");
        assert_ne!(id, other);
    }

    #[tokio::test]
    async fn refresh_reports_presence() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        assert!(!registry.refresh("nope"));

        let id = registry.add(endpoint(), "test:1", "alice");
        assert!(registry.refresh(&id));

        assert!(registry.remove(&id));
        assert!(!registry.refresh(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_strictly_advances_expiry() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let id = registry.add(endpoint(), "test:1", "alice");

        let before = registry.expires_at(&id).unwrap();
        assert!(registry.refresh(&id));
        let after = registry.expires_at(&id).unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn remove_closes_and_is_idempotent() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let id = registry.add(endpoint(), "test:1", "alice");
        let endpoint = registry.get_endpoint(&id).unwrap();

        assert!(registry.remove(&id));
        assert!(endpoint.is_closed());
        assert!(registry.get_endpoint(&id).is_none());
        assert!(!registry.remove(&id));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_connections() {
        let registry = ConnectionRegistry::start(config(Duration::from_secs(60)));
        let id = registry.add(endpoint(), "test:1", "alice");
        let endpoint = registry.get_endpoint(&id).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(registry.contains(&id));

        // The sweep at t=60s sees the expiry as reached.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!registry.contains(&id));
        assert!(endpoint.is_closed());

        let events = registry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status(), EventStatus::Expire);
        assert_eq!(events[0].connection_id(), id);

        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_connection_outlives_its_first_deadline() {
        let registry = ConnectionRegistry::new(config(Duration::from_secs(60)));
        let id = registry.add(endpoint(), "test:1", "alice");

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(registry.refresh(&id));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.evict_expired(), 0);
        assert!(registry.contains(&id));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.evict_expired(), 1);
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn snapshot_lists_live_connections() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let id = registry.add(endpoint(), "db.internal:5432", "alice");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].destination, "db.internal:5432");
        assert_eq!(snapshot[0].user, "alice");
        assert!(snapshot[0].expires_at > snapshot[0].created_at);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let registry = ConnectionRegistry::start(RegistryConfig::default());
        let endpoints: Vec<Arc<Endpoint>> = (0..3)
            .map(|_| registry.add(endpoint(), "test:1", "alice"))
            .map(|id| registry.get_endpoint(&id).unwrap())
            .collect();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert!(endpoints.iter().all(|endpoint| endpoint.is_closed()));
    }
}
