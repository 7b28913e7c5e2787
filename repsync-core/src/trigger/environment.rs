//! Connectivity and visibility signals
//!
//! The trigger controller only needs two things from its host: whether
//! the remote is reachable right now, and a stream of changes. Apps that
//! get OS callbacks drive a `ManualEnvironment`; headless hosts can use
//! `PollingEnvironment`, which probes the remote with a TCP connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    /// Reachability changed; `true` means back online
    ConnectivityChanged(bool),
    /// The app became visible again
    Foreground,
}

pub trait Environment: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent>;
}

/// Environment driven by explicit calls
pub struct ManualEnvironment {
    online: AtomicBool,
    events: broadcast::Sender<EnvironmentEvent>,
}

impl ManualEnvironment {
    pub fn new(online: bool) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            online: AtomicBool::new(online),
            events,
        }
    }

    /// Only actual transitions are announced
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            debug!(online, "connectivity changed");
            let _ = self.events.send(EnvironmentEvent::ConnectivityChanged(online));
        }
    }

    pub fn foreground(&self) {
        let _ = self.events.send(EnvironmentEvent::Foreground);
    }
}

impl Environment for ManualEnvironment {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.events.subscribe()
    }
}

/// Reachability by periodically opening a TCP connection to the remote
pub struct PollingEnvironment {
    state: Arc<ManualEnvironment>,
    target: String,
    interval: Duration,
    probe_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingEnvironment {
    pub fn new(target: impl Into<String>, interval: Duration) -> Self {
        Self {
            state: Arc::new(ManualEnvironment::new(false)),
            target: target.into(),
            interval,
            probe_timeout: Duration::from_secs(3),
            task: Mutex::new(None),
        }
    }

    /// Probe the host and port of a remote base URL
    pub fn for_url(url: &Url, interval: Duration) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self::new(format!("{}:{}", host, port), interval))
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Probe once and update the state
    pub async fn probe(&self) -> bool {
        let online = probe(&self.target, self.probe_timeout).await;
        self.state.set_online(online);
        online
    }

    /// Start polling in the background. Does nothing if already polling.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let target = self.target.clone();
        let interval = self.interval;
        let probe_timeout = self.probe_timeout;

        info!(target = %target, interval_ms = interval.as_millis() as u64, "starting reachability polling");
        *task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                state.set_online(probe(&target, probe_timeout).await);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Drop for PollingEnvironment {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Environment for PollingEnvironment {
    fn is_online(&self) -> bool {
        self.state.is_online()
    }

    fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.state.subscribe()
    }
}

async fn probe(target: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}
