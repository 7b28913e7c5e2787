/*
    Trigger subsystem - Deciding when to flush

    Flushes are requested on:
    - start, if online and the queue is not empty
    - offline to online transitions
    - foreground, if online and the queue is not empty
    - a fixed interval, if online, the queue is not empty and no pass is active
    - manual retry

    Every request is dropped while offline. Requests made while a pass is
    running are absorbed by the engine's single-flight guard.
*/

pub mod environment;

pub use environment::{Environment, EnvironmentEvent, ManualEnvironment, PollingEnvironment};

use crate::flush::engine::{FlushEngine, FlushOutcome};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Startup,
    ConnectivityRestored,
    Foreground,
    Interval,
    Manual,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Startup => "startup",
            TriggerReason::ConnectivityRestored => "connectivity_restored",
            TriggerReason::Foreground => "foreground",
            TriggerReason::Interval => "interval",
            TriggerReason::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Applies the firing rules and spawns passes
#[derive(Clone)]
struct Dispatcher {
    engine: Arc<FlushEngine>,
    environment: Arc<dyn Environment>,
}

impl Dispatcher {
    fn fire(&self, reason: TriggerReason) -> Option<JoinHandle<FlushOutcome>> {
        if !self.environment.is_online() {
            debug!(reason = %reason, "offline, flush request ignored");
            return None;
        }

        let needs_work = matches!(reason, TriggerReason::Manual | TriggerReason::ConnectivityRestored);
        if !needs_work && self.engine.store().is_empty() {
            debug!(reason = %reason, "queue empty, flush request ignored");
            return None;
        }

        if self.engine.is_active() {
            debug!(reason = %reason, "flush already active, request absorbed");
            return None;
        }

        debug!(reason = %reason, "flush requested");
        let engine = Arc::clone(&self.engine);
        Some(tokio::spawn(async move { engine.flush().await }))
    }
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TriggerController {
    dispatcher: Dispatcher,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl TriggerController {
    /// Controller for `engine`. A zero `interval` turns off interval passes.
    pub fn new(engine: Arc<FlushEngine>, environment: Arc<dyn Environment>, interval: Duration) -> Self {
        Self {
            dispatcher: Dispatcher { engine, environment },
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Start listening. Returns false if already started.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!("trigger controller already running");
            return false;
        }

        let dispatcher = self.dispatcher.clone();
        let status = Arc::clone(dispatcher.engine.status());
        status.set_offline(!dispatcher.environment.is_online());

        // Subscribe before the startup check so no transition is missed
        let events = dispatcher.environment.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        dispatcher.fire(TriggerReason::Startup);

        let period = self.interval;
        let handle = tokio::spawn(run_loop(dispatcher, events, shutdown_rx, period));

        info!(interval_ms = period.as_millis() as u64, "trigger controller started");
        *running = Some(Running { shutdown_tx, handle });
        true
    }

    /// Stop listening. Passes already in flight run to completion.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(running) = running else {
            return false;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(error = %e, "trigger loop ended abnormally");
        }
        info!("trigger controller stopped");
        true
    }

    /// Ask for a pass now
    pub fn request_flush(&self, reason: TriggerReason) -> Option<JoinHandle<FlushOutcome>> {
        self.dispatcher.fire(reason)
    }

    /// The user's "retry" action
    pub fn retry_now(&self) -> Option<JoinHandle<FlushOutcome>> {
        self.request_flush(TriggerReason::Manual)
    }
}

impl Drop for TriggerController {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take() {
            running.handle.abort();
        }
    }
}

async fn run_loop(
    dispatcher: Dispatcher,
    mut events: broadcast::Receiver<EnvironmentEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    period: Duration,
) {
    // Zero disables the periodic trigger; interval_at rejects a zero period
    let periodic = !period.is_zero();
    let mut tick = interval_at(Instant::now() + period, period.max(Duration::from_secs(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let status = Arc::clone(dispatcher.engine.status());
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            event = events.recv(), if events_open => match event {
                Ok(EnvironmentEvent::ConnectivityChanged(true)) => {
                    info!("connectivity restored");
                    status.set_offline(false);
                    dispatcher.fire(TriggerReason::ConnectivityRestored);
                }
                Ok(EnvironmentEvent::ConnectivityChanged(false)) => {
                    info!("connectivity lost");
                    status.set_offline(true);
                }
                Ok(EnvironmentEvent::Foreground) => {
                    dispatcher.fire(TriggerReason::Foreground);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "environment events lagged");
                    status.set_offline(!dispatcher.environment.is_online());
                }
                Err(RecvError::Closed) => {
                    warn!("environment event stream closed, interval trigger only");
                    events_open = false;
                }
            },

            _ = tick.tick(), if periodic => {
                dispatcher.fire(TriggerReason::Interval);
            }
        }
    }
}
