//! Session registry and background sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::group::{deadline_after, GroupConfig, GroupOptions, MAX_DURATION};
use super::key::SessionKey;
use super::session::{Session, SessionQueue};
use crate::config::PenaltyBoxConfig;
use crate::error::{PenaltyBoxError, Result};

/// Group used when the caller does not name one.
pub const DEFAULT_GROUP: &str = "default";
/// Default period of the background sweep.
pub const DEFAULT_CLEAR_INTERVAL: Duration = Duration::from_secs(60);

/// How often `stop` checks whether the sweep worker has exited.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Lower bound on the sweep period; tokio intervals cannot be zero.
const MIN_CLEAR_INTERVAL: Duration = Duration::from_millis(1);

/// Options for constructing a [`Controller`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Period of the background sweep
    pub clear_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            clear_interval: DEFAULT_CLEAR_INTERVAL,
        }
    }
}

impl ControllerOptions {
    /// Set the period of the background sweep.
    ///
    /// Values are clamped to between 1ms and [`MAX_DURATION`].
    pub fn clear_interval(mut self, interval: Duration) -> Self {
        self.clear_interval = interval;
        self
    }
}

/// State shared between the controller and its sweep worker.
struct Shared {
    /// Live sessions indexed by registry key
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Live sessions ordered by expiry
    queue: Arc<SessionQueue>,
}

impl Shared {
    /// Remove every session whose expiry is at or before `now`.
    ///
    /// Returns the number of sessions expired.
    fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;

        while let Some((key, session)) = self.queue.pop_if_expired(now) {
            if !session.expire_or_requeue(now) {
                continue;
            }

            {
                let mut sessions = self.sessions.write();
                if sessions.get(&key).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    sessions.remove(&key);
                }
            }

            debug!(key = %session.key(), counter = session.counter(), "Session expired");
            removed += 1;
        }

        removed
    }
}

/// Entry point of the penalty box.
///
/// Owns the per-group configuration, the session registry and a single
/// background task that periodically forgets sessions whose TTL has run out.
/// The controller is meant to be constructed once and shared (e.g. in an
/// `Arc`) by request handlers.
pub struct Controller {
    shared: Arc<Shared>,
    groups: DashMap<String, GroupConfig>,
    cancel: CancellationToken,
    worker_exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("sessions", &self.session_count())
            .field("groups", &self.groups.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Controller {
    /// Create a controller and start its sweep worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; see [`Controller::try_new`].
    pub fn new(options: ControllerOptions) -> Self {
        Self::start(options, &Handle::current())
    }

    /// Create a controller, failing instead of panicking when no tokio
    /// runtime is available to run the sweep worker.
    pub fn try_new(options: ControllerOptions) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| PenaltyBoxError::Runtime(e.to_string()))?;
        Ok(Self::start(options, &handle))
    }

    fn start(options: ControllerOptions, runtime: &Handle) -> Self {
        let shared = Arc::new(Shared {
            sessions: RwLock::new(HashMap::new()),
            queue: Arc::new(SessionQueue::new()),
        });
        let cancel = CancellationToken::new();
        let worker_exited = Arc::new(AtomicBool::new(false));

        runtime.spawn(run_sweeper(
            Arc::clone(&shared),
            options.clear_interval.clamp(MIN_CLEAR_INTERVAL, MAX_DURATION),
            cancel.clone(),
            Arc::clone(&worker_exited),
        ));

        let groups = DashMap::new();
        groups.insert(DEFAULT_GROUP.to_string(), GroupConfig::default());

        Self {
            shared,
            groups,
            cancel,
            worker_exited,
        }
    }

    /// Create a controller from a validated configuration file.
    pub fn from_config(config: &PenaltyBoxConfig) -> Result<Self> {
        config.validate()?;

        let options = ControllerOptions::default().clear_interval(config.clear_interval());
        let controller = Self::try_new(options)?;
        if let Some(ref settings) = config.default {
            controller.set_config_for_group(DEFAULT_GROUP, settings.to_options());
        }
        for (group, settings) in &config.groups {
            controller.set_config_for_group(group, settings.to_options());
        }

        Ok(controller)
    }

    /// Install or replace the configuration of a group.
    ///
    /// Unset options take the documented defaults. Live sessions keep the
    /// configuration they were created with.
    pub fn set_config_for_group(&self, group: &str, options: GroupOptions) {
        let config = options.build();
        info!(
            group = %group,
            ttl_secs = config.ttl.as_secs(),
            initial_interval_ms = config.initial_interval.as_millis() as u64,
            multiplier = config.multiplier,
            max_interval_ms = config.max_interval.as_millis() as u64,
            "Group configuration installed"
        );
        self.groups.insert(group.to_string(), config);
    }

    /// Configuration that new sessions of `group` are created with.
    ///
    /// Groups without their own configuration use the default group's.
    pub fn group_config(&self, group: &str) -> GroupConfig {
        self.groups
            .get(group)
            .or_else(|| self.groups.get(DEFAULT_GROUP))
            .map(|config| *config)
            .unwrap_or_default()
    }

    /// Get or create the session for `key` in the default group.
    pub fn get(&self, key: &str) -> Arc<Session> {
        self.get_for_group(key, DEFAULT_GROUP)
    }

    /// Get or create the session for `key` in `group`.
    ///
    /// An expired session is never returned; a fresh one replaces it.
    pub fn get_for_group(&self, key: &str, group: &str) -> Arc<Session> {
        let session_key = SessionKey::new(key, group);
        let registry_key = session_key.to_string_key();

        if let Some(session) = self.lookup(&registry_key) {
            return session;
        }

        let config = self.group_config(group);
        let mut sessions = self.shared.sessions.write();

        // Another caller may have created it while we waited for the lock.
        if let Some(session) = sessions.get(&registry_key).filter(|s| !s.is_expired()) {
            return Arc::clone(session);
        }

        let session = Session::register(session_key, config, &self.shared.queue);
        sessions.insert(registry_key, Arc::clone(&session));

        debug!(
            key = %session.key(),
            ttl_secs = config.ttl.as_secs(),
            "Created new session"
        );
        session
    }

    /// Look up the live session for `key` in the default group without creating one.
    pub fn get_if_exists(&self, key: &str) -> Option<Arc<Session>> {
        self.get_if_exists_for_group(key, DEFAULT_GROUP)
    }

    /// Look up the live session for `key` in `group` without creating one.
    pub fn get_if_exists_for_group(&self, key: &str, group: &str) -> Option<Arc<Session>> {
        self.lookup(&SessionKey::new(key, group).to_string_key())
    }

    /// Get the number of sessions in the registry.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.read().len()
    }

    /// Whether the sweep worker is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_exited.load(Ordering::Acquire)
    }

    /// Stop the sweep worker, waiting at most `timeout` for it to exit.
    ///
    /// See [`Controller::stop_with`].
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.stop_with(tokio::time::sleep(timeout)).await
    }

    /// Stop the sweep worker, waiting until it exits or `deadline` resolves.
    ///
    /// Returns `true` if the worker was observed to have exited. A `false`
    /// result means the deadline won; the worker has been asked to stop but
    /// may still be running. Sessions remain usable after stopping, they are
    /// just no longer swept.
    pub async fn stop_with<F>(&self, deadline: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.cancel.cancel();

        let exited = async {
            while self.is_running() {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            biased;
            _ = exited => true,
            _ = deadline => {
                let stopped = !self.is_running();
                if !stopped {
                    warn!("Session sweeper did not exit before the stop deadline");
                }
                stopped
            }
        }
    }

    fn lookup(&self, registry_key: &str) -> Option<Arc<Session>> {
        let sessions = self.shared.sessions.read();
        sessions
            .get(registry_key)
            .filter(|s| !s.is_expired())
            .map(Arc::clone)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background loop that periodically sweeps expired sessions.
async fn run_sweeper(
    shared: Arc<Shared>,
    interval: Duration,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "Session sweeper started");

    let mut ticker = tokio::time::interval_at(deadline_after(Instant::now(), interval), interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = shared.sweep(Instant::now());
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = shared.queue.len(),
                        "Swept expired sessions"
                    );
                }
            }
        }
    }

    exited.store(true, Ordering::Release);
    info!("Session sweeper stopped");
}
