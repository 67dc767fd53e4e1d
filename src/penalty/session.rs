//! Per-key backoff state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::group::{deadline_after, GroupConfig};
use super::key::SessionKey;
use super::queue::ExpiryQueue;

/// Priority registry holding live sessions.
pub(crate) type SessionQueue = ExpiryQueue<Arc<Session>>;

/// Mutable fields of a session, guarded by the session's own lock.
#[derive(Debug)]
struct SessionState {
    /// Failures recorded by the caller
    counter: u64,
    /// Completed backoff escalations
    backoff_stage: u32,
    /// The key may act again once now >= this instant
    next_allowed_at: Instant,
    /// The sweep removes the session once now >= this instant
    expires_at: Instant,
}

/// Live rate-limit state for one key within one group.
///
/// Sessions are created by the [`Controller`](super::Controller) and shared
/// as `Arc<Session>`. Once the background sweep expires a session it stays
/// inert forever: every mutator becomes a no-op and returns `false`, and the
/// caller should fetch a fresh session from the controller.
pub struct Session {
    key: SessionKey,
    registry_key: String,
    config: GroupConfig,
    /// One-way flag, readable without taking the state lock
    expired: AtomicBool,
    state: Mutex<SessionState>,
    queue: Weak<SessionQueue>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("expired", &self.is_expired())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Session {
    /// Create a session and track it in `queue`.
    pub(crate) fn register(
        key: SessionKey,
        config: GroupConfig,
        queue: &Arc<SessionQueue>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let registry_key = key.to_string_key();
        let session = Arc::new(Self {
            key,
            registry_key,
            config,
            expired: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                counter: 0,
                backoff_stage: 0,
                next_allowed_at: now,
                expires_at: deadline_after(now, config.ttl),
            }),
            queue: Arc::downgrade(queue),
        });

        let expires_at = deadline_after(now, config.ttl);
        queue.insert(&session.registry_key, expires_at, Arc::clone(&session));
        session
    }

    /// Whether the key may act now.
    pub fn is_allowed(&self) -> bool {
        Instant::now() >= self.state.lock().next_allowed_at
    }

    /// Add `n` to the failure counter and refresh the TTL.
    ///
    /// Returns `false` without mutating anything if the session has expired.
    pub fn add_counter(&self, n: u64) -> bool {
        self.mutate(|state, _| {
            state.counter = state.counter.saturating_add(n);
        })
    }

    /// Add one to the failure counter. See [`Session::add_counter`].
    pub fn increment(&self) -> bool {
        self.add_counter(1)
    }

    /// Failures recorded so far.
    pub fn counter(&self) -> u64 {
        self.state.lock().counter
    }

    /// Escalate the backoff by one stage.
    ///
    /// The key is blocked for `min(initial * multiplier^stage, max)` from now
    /// and the TTL is refreshed. Returns `false` without mutating anything if
    /// the session has expired; fetch a fresh one from the controller.
    pub fn add_backoff(&self) -> bool {
        self.mutate(|state, now| {
            let delay = self.config.delay_for_stage(state.backoff_stage);
            state.next_allowed_at = deadline_after(now, delay);
            state.backoff_stage = state.backoff_stage.saturating_add(1);

            trace!(
                key = %self.key,
                stage = state.backoff_stage,
                delay_ms = delay.as_millis() as u64,
                "Backoff escalated"
            );
        })
    }

    /// Clear the counter and backoff, allowing the key immediately.
    ///
    /// Returns `false` without mutating anything if the session has expired.
    pub fn reset(&self) -> bool {
        self.mutate(|state, now| {
            state.counter = 0;
            state.backoff_stage = 0;
            state.next_allowed_at = now;
        })
    }

    /// Remaining wait in whole seconds, rounded up. Never negative.
    pub fn next_allowed_until_seconds(&self) -> i64 {
        let next_allowed_at = self.state.lock().next_allowed_at;
        let remaining = next_allowed_at.saturating_duration_since(Instant::now());

        let secs = i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX);
        if remaining.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }

    /// The instant from which the key is allowed again.
    pub fn next_allowed(&self) -> Instant {
        self.state.lock().next_allowed_at
    }

    /// Identity of this session. Its `Display` form is the composite
    /// `"{group}:{key}"` string, also available as [`Session::key_string`].
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// The composite `"{group}:{key}"` string this session is registered under.
    pub fn key_string(&self) -> &str {
        &self.registry_key
    }

    /// Number of completed backoff escalations.
    pub fn backoff_stage(&self) -> u32 {
        self.state.lock().backoff_stage
    }

    /// The instant from which the sweep may remove this session.
    pub fn expires_at(&self) -> Instant {
        self.state.lock().expires_at
    }

    /// Configuration copied from the group when the session was created.
    pub fn group_config(&self) -> &GroupConfig {
        &self.config
    }

    /// Whether the sweep has removed this session.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Called by the sweep after popping this session from the queue.
    ///
    /// Marks the session expired if it is still due at `now`. If a concurrent
    /// touch refreshed it after the pop, it is re-queued under its current
    /// expiry instead and `false` is returned.
    pub(crate) fn expire_or_requeue(self: &Arc<Self>, now: Instant) -> bool {
        let state = self.state.lock();
        if self.is_expired() {
            return true;
        }

        if state.expires_at > now {
            if let Some(queue) = self.queue.upgrade() {
                queue.insert(&self.registry_key, state.expires_at, Arc::clone(self));
            }
            return false;
        }

        self.expired.store(true, Ordering::Release);
        true
    }

    /// Apply a mutation under the state lock and refresh the TTL.
    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionState, Instant),
    {
        let mut state = self.state.lock();
        if self.is_expired() {
            return false;
        }

        let now = Instant::now();
        f(&mut state, now);

        state.expires_at = deadline_after(now, self.config.ttl);
        if let Some(queue) = self.queue.upgrade() {
            queue.update_expiry(&self.registry_key, state.expires_at, |tracked| {
                std::ptr::eq(Arc::as_ptr(tracked), self)
            });
        }
        true
    }
}
