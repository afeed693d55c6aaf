//! Backend reachability tracking
//!
//! Combines the platform's network-online signal with a periodic liveness
//! probe against the exam backend. Status changes are published on a
//! `watch` channel so the sync engine reacts to transitions instead of
//! polling.

use crate::config::{ConnectivityConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Current best-effort reachability of the exam backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Available,
    Unavailable,
}

/// Status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameAvailable,
    BecameUnavailable,
}

/// Debounce state machine.
///
/// - available after `required_successes` consecutive successful probes,
///   or after an OS online event followed by one successful probe
/// - unavailable immediately on a failed probe or an OS offline event
/// - probe results are ignored while the OS reports offline
#[derive(Debug, Clone)]
pub struct Debouncer {
    required_successes: u32,
    os_online: bool,
    online_event_pending: bool,
    consecutive_successes: u32,
    status: Connectivity,
}

impl Debouncer {
    pub fn new(required_successes: u32) -> Self {
        Self {
            required_successes: required_successes.max(1),
            os_online: true,
            online_event_pending: false,
            consecutive_successes: 0,
            status: Connectivity::Unavailable,
        }
    }

    pub fn status(&self) -> Connectivity {
        self.status
    }

    pub fn os_online(&self) -> bool {
        self.os_online
    }

    pub fn on_network_change(&mut self, online: bool) -> Option<Transition> {
        if online == self.os_online {
            return None;
        }
        self.os_online = online;
        self.consecutive_successes = 0;

        if online {
            self.online_event_pending = true;
            None
        } else {
            self.online_event_pending = false;
            self.set(Connectivity::Unavailable)
        }
    }

    pub fn on_probe(&mut self, success: bool) -> Option<Transition> {
        if !self.os_online {
            return None;
        }

        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.online_event_pending || self.consecutive_successes >= self.required_successes {
                self.online_event_pending = false;
                return self.set(Connectivity::Available);
            }
            None
        } else {
            self.consecutive_successes = 0;
            self.online_event_pending = false;
            self.set(Connectivity::Unavailable)
        }
    }

    fn set(&mut self, status: Connectivity) -> Option<Transition> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(match status {
            Connectivity::Available => Transition::BecameAvailable,
            Connectivity::Unavailable => Transition::BecameUnavailable,
        })
    }
}

/// Cheap liveness check against the backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// `GET {server_url}{probe_path}`; any 2xx counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(sync: &SyncConfig, connectivity: &ConnectivityConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(connectivity.probe_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create probe client: {}", e)))?;

        Ok(Self {
            client,
            url: format!(
                "{}{}",
                sync.server_url.trim_end_matches('/'),
                connectivity.probe_path
            ),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Liveness probe failed");
                false
            }
        }
    }
}

/// Connectivity monitor
pub struct ConnectivityMonitor {
    debouncer: Mutex<Debouncer>,
    status_tx: watch::Sender<Connectivity>,
    probe: Arc<dyn Probe>,
    config: ConnectivityConfig,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn Probe>, config: ConnectivityConfig) -> Self {
        let (status_tx, _) = watch::channel(Connectivity::Unavailable);
        Self {
            debouncer: Mutex::new(Debouncer::new(config.required_successes)),
            status_tx,
            probe,
            config,
        }
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> Connectivity {
        *self.status_tx.borrow()
    }

    pub fn is_available(&self) -> bool {
        self.status() == Connectivity::Available
    }

    /// Feed the platform's network-online signal.
    pub async fn set_network_online(&self, online: bool) -> Option<Transition> {
        let transition = self.debouncer.lock().await.on_network_change(online);
        tracing::debug!(online, "OS network status changed");
        self.publish(transition);
        transition
    }

    /// Run one probe unless the OS reports offline.
    pub async fn probe_once(&self) -> Option<Transition> {
        if !self.debouncer.lock().await.os_online() {
            return None;
        }

        let success = tokio::time::timeout(self.config.probe_timeout, self.probe.check())
            .await
            .unwrap_or(false);

        let transition = self.debouncer.lock().await.on_probe(success);
        self.publish(transition);
        transition
    }

    fn publish(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::BecameAvailable) => {
                tracing::info!("Exam backend became available");
                self.status_tx.send_replace(Connectivity::Available);
            }
            Some(Transition::BecameUnavailable) => {
                tracing::warn!("Exam backend became unavailable");
                self.status_tx.send_replace(Connectivity::Unavailable);
            }
            None => {}
        }
    }

    /// Probe periodically until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Connectivity monitor stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn monitor(probe: MockProbe, required: u32) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            Arc::new(probe),
            ConnectivityConfig {
                required_successes: required,
                probe_timeout: Duration::from_millis(50),
                ..ConnectivityConfig::default()
            },
        )
    }

    #[test]
    fn test_requires_consecutive_successes() {
        let mut d = Debouncer::new(3);
        assert_eq!(d.on_probe(true), None);
        assert_eq!(d.on_probe(true), None);
        assert_eq!(d.on_probe(true), Some(Transition::BecameAvailable));
        assert_eq!(d.on_probe(true), None);
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let mut d = Debouncer::new(2);
        d.on_probe(true);
        d.on_probe(false);
        assert_eq!(d.on_probe(true), None);
        assert_eq!(d.on_probe(true), Some(Transition::BecameAvailable));
    }

    #[test]
    fn test_unavailable_immediately_on_first_failure() {
        let mut d = Debouncer::new(2);
        d.on_probe(true);
        d.on_probe(true);
        assert_eq!(d.on_probe(false), Some(Transition::BecameUnavailable));
    }

    #[test]
    fn test_online_event_plus_one_probe() {
        let mut d = Debouncer::new(5);
        assert_eq!(d.on_network_change(false), None);
        assert_eq!(d.on_probe(true), None, "probes ignored while offline");
        assert_eq!(d.on_network_change(true), None);
        assert_eq!(d.on_probe(true), Some(Transition::BecameAvailable));
    }

    #[test]
    fn test_os_offline_drops_availability() {
        let mut d = Debouncer::new(1);
        d.on_probe(true);
        assert_eq!(d.status(), Connectivity::Available);
        assert_eq!(d.on_network_change(false), Some(Transition::BecameUnavailable));
    }

    #[tokio::test]
    async fn test_monitor_publishes_transitions() {
        let mut probe = MockProbe::new();
        let mut results = vec![true, true, false].into_iter();
        probe
            .expect_check()
            .times(3)
            .returning(move || results.next().unwrap_or(false));

        let monitor = monitor(probe, 2);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.probe_once().await, None);
        assert_eq!(monitor.probe_once().await, Some(Transition::BecameAvailable));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Available);

        assert_eq!(monitor.probe_once().await, Some(Transition::BecameUnavailable));
        assert!(!monitor.is_available());
    }

    #[tokio::test]
    async fn test_monitor_skips_probe_while_offline() {
        let mut probe = MockProbe::new();
        probe.expect_check().never();

        let monitor = monitor(probe, 1);
        monitor.set_network_online(false).await;
        assert_eq!(monitor.probe_once().await, None);
        assert_eq!(monitor.status(), Connectivity::Unavailable);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Probe(bool),
        Network(bool),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            3 => any::<bool>().prop_map(Event::Probe),
            1 => any::<bool>().prop_map(Event::Network),
        ]
    }

    proptest! {
        #[test]
        fn prop_debounce_invariants(
            required in 1u32..5,
            events in proptest::collection::vec(event(), 0..60),
        ) {
            let mut d = Debouncer::new(required);
            let mut last_transition = None;

            for e in events {
                let before = d.status();
                let transition = match e {
                    Event::Probe(ok) => d.on_probe(ok),
                    Event::Network(online) => d.on_network_change(online),
                };

                if let Event::Probe(false) = e {
                    if d.os_online() {
                        prop_assert_eq!(d.status(), Connectivity::Unavailable);
                    }
                }
                if let Event::Network(false) = e {
                    prop_assert_eq!(d.status(), Connectivity::Unavailable);
                }
                if d.status() == Connectivity::Available {
                    prop_assert!(d.os_online());
                }
                if before == d.status() {
                    prop_assert!(transition.is_none());
                }
                if let Some(t) = transition {
                    prop_assert_ne!(Some(t), last_transition);
                    last_transition = Some(t);
                }
            }
        }
    }
}
