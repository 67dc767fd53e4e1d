//! Penalty box engine: sessions, backoff and expiry sweep.

mod controller;
mod group;
mod key;
mod queue;
mod session;

pub use controller::{Controller, ControllerOptions, DEFAULT_CLEAR_INTERVAL, DEFAULT_GROUP};
pub use group::{
    GroupConfig, GroupOptions, DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL, DEFAULT_MULTIPLIER,
    DEFAULT_TTL, MAX_DURATION,
};
pub use key::SessionKey;
pub use queue::ExpiryQueue;
pub use session::Session;
