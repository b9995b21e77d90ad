//! Connection supervision for a [`SyncCore`](crate::core::SyncCore).
//!
//! The [`ConnectionSupervisor`] owns the single [`ConnectionState`] of a
//! core. It probes the backing service on a fixed interval and on
//! environment signals, and when a probe fails it runs a reconnection loop
//! that refreshes credentials with a fixed delay between attempts. At most
//! one reconnection loop runs at a time.
//!
//! Every status transition is fanned out to registered listeners with the
//! previous and next status. Listeners are called outside the state lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use ticketsync_proto::ids::Timestamp;

use crate::backend::RealtimeTransport;

/// Reachability of the backing service as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// The last probe or credential refresh succeeded.
    Connected,
    /// A credential refresh is in flight (or nothing has been checked yet).
    Connecting,
    /// The last probe or refresh failed, or the environment went offline.
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Snapshot of the supervisor's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// When the last probe or refresh finished.
    pub last_checked_at: Option<Timestamp>,
    /// When the client last went from reachable to unreachable. Cleared on
    /// the next transition into `Connected`.
    pub disconnected_since: Option<Timestamp>,
}

impl ConnectionState {
    const fn initial() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            last_checked_at: None,
            disconnected_since: None,
        }
    }

    /// Whether the client has been unreachable for longer than `grace`.
    ///
    /// Short blips stay invisible; a passive indicator is shown only once
    /// this returns `true`.
    #[must_use]
    pub fn is_degraded(&self, now: Timestamp, grace: Duration) -> bool {
        let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self.status != ConnectionStatus::Connected
            && self
                .disconnected_since
                .is_some_and(|since| now.millis_since(since) >= grace_ms)
    }
}

/// Signals from the hosting environment (network, visibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    /// The client became visible to the user again.
    Visible,
    /// The client was hidden.
    Hidden,
    /// The network came back.
    Online,
    /// The network went away.
    Offline,
}

/// Handle returned by [`ConnectionSupervisor::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked with `(previous, next)` on every status transition.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus, ConnectionStatus) + Send + Sync>;

/// Timing configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between periodic liveness probes.
    pub probe_interval: Duration,
    /// Upper bound for a single probe.
    pub probe_timeout: Duration,
    /// Upper bound for a single credential refresh.
    pub refresh_timeout: Duration,
    /// Delay before retrying a failed reconnection attempt.
    pub retry_delay: Duration,
    /// How long a disconnection stays invisible to the user.
    pub degraded_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            degraded_grace: Duration::from_secs(10),
        }
    }
}

struct Inner<T> {
    transport: Arc<T>,
    config: SupervisorConfig,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(ListenerId, StatusListener)>>,
    next_listener: AtomicU64,
    reconnecting: AtomicBool,
    visible: AtomicBool,
    stopped: AtomicBool,
    trigger: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Tracks reachability of the backing service and drives reconnection.
pub struct ConnectionSupervisor<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ConnectionSupervisor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: RealtimeTransport + 'static> ConnectionSupervisor<T> {
    /// Creates a supervisor in the `Connecting` state. Nothing runs until
    /// [`start`](Self::start) or [`check_now`](Self::check_now).
    #[must_use]
    pub fn new(transport: Arc<T>, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(ConnectionState::initial()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                reconnecting: AtomicBool::new(false),
                visible: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                trigger: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Shorthand for `status().status == Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().status == ConnectionStatus::Connected
    }

    /// Whether the client was last reported visible.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::Acquire)
    }

    /// The configured degraded grace period.
    #[must_use]
    pub fn degraded_grace(&self) -> Duration {
        self.inner.config.degraded_grace
    }

    /// Registers a transition listener.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionStatus, ConnectionStatus) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Starts the periodic probe loop. The first probe runs immediately.
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
        let this = self.clone();
        let interval = self.inner.config.probe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = this.inner.trigger.notified() => {}
                }
                this.check_now().await;
            }
        });
        self.inner.tasks.lock().push(handle);
        tracing::debug!(?interval, "connection supervisor started");
    }

    /// Stops probing and any reconnection loop.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        self.inner.reconnecting.store(false, Ordering::Release);
        tracing::debug!("connection supervisor stopped");
    }

    /// Reacts to an environment signal.
    pub fn signal(&self, signal: EnvironmentSignal) {
        tracing::debug!(?signal, "environment signal");
        match signal {
            EnvironmentSignal::Visible => {
                self.inner.visible.store(true, Ordering::Release);
                self.inner.trigger.notify_one();
            }
            EnvironmentSignal::Hidden => {
                self.inner.visible.store(false, Ordering::Release);
            }
            EnvironmentSignal::Online => self.inner.trigger.notify_one(),
            EnvironmentSignal::Offline => self.transition(ConnectionStatus::Disconnected),
        }
    }

    /// Asks the probe loop to check reachability right away.
    ///
    /// Called when a subscription stream or a write fails unexpectedly.
    pub fn report_transport_failure(&self) {
        self.inner.trigger.notify_one();
    }

    /// Probes the backing service once. Does nothing while a reconnection
    /// loop is running.
    pub async fn check_now(&self) {
        if self.inner.reconnecting.load(Ordering::Acquire) {
            return;
        }
        let timeout = self.inner.config.probe_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.probe()).await {
            Ok(Ok(())) => self.transition(ConnectionStatus::Connected),
            Ok(Err(e)) => {
                tracing::info!(error = %e, "liveness probe failed");
                self.transition(ConnectionStatus::Disconnected);
                self.reconnect();
            }
            Err(_) => {
                tracing::info!(?timeout, "liveness probe timed out");
                self.transition(ConnectionStatus::Disconnected);
                self.reconnect();
            }
        }
    }

    /// Starts a reconnection loop unless one is already running.
    ///
    /// Each attempt refreshes credentials under the refresh timeout. A
    /// failed attempt leaves the status `Disconnected` and schedules the
    /// next attempt after the retry delay; attempts never overlap.
    pub fn reconnect(&self) {
        if self.inner.stopped.load(Ordering::Acquire)
            || self.inner.reconnecting.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.reconnect_loop().await;
            this.inner.reconnecting.store(false, Ordering::Release);
        });
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn reconnect_loop(&self) {
        let config = &self.inner.config;
        let mut attempt: u32 = 0;
        while !self.inner.stopped.load(Ordering::Acquire) {
            attempt += 1;
            self.transition(ConnectionStatus::Connecting);
            let result = tokio::time::timeout(
                config.refresh_timeout,
                self.inner.transport.refresh_credentials(),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    tracing::info!(attempt, "reconnected");
                    self.transition(ConnectionStatus::Connected);
                    return;
                }
                Ok(Err(e)) => tracing::warn!(attempt, error = %e, "reconnect attempt failed"),
                Err(_) => tracing::warn!(attempt, "reconnect attempt timed out"),
            }
            self.transition(ConnectionStatus::Disconnected);
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    fn transition(&self, next: ConnectionStatus) {
        let now = Timestamp::now();
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = state.status;
            state.last_checked_at = Some(now);
            if previous == next {
                return;
            }
            state.status = next;
            match next {
                ConnectionStatus::Connected => state.disconnected_since = None,
                ConnectionStatus::Disconnected => {
                    state.disconnected_since.get_or_insert(now);
                }
                ConnectionStatus::Connecting => {}
            }
            previous
        };

        tracing::info!(from = %previous, to = %next, "connection status changed");
        let listeners: Vec<StatusListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(previous, next);
        }
    }
}
