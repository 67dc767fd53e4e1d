//! Penaltybox - In-process adaptive rate limiting
//!
//! This crate throttles repeated-failure actions (login attempts, registrations)
//! per key and per group. Each key escalates through an exponential backoff with
//! a ceiling, and keys that stay inactive past their TTL are forgotten by a
//! background sweep driven by an expiry-ordered heap.
//!
//! The sweep runs as a tokio task, so a [`Controller`] must be created inside
//! a tokio runtime. [`Controller::new`] panics otherwise;
//! [`Controller::try_new`] returns [`PenaltyBoxError::Runtime`] instead.
//!
//! ```no_run
//! use std::time::Duration;
//! use penaltybox::{Controller, ControllerOptions, GroupOptions};
//!
//! # async fn run() {
//! let controller = Controller::new(ControllerOptions::default());
//! controller.set_config_for_group(
//!     "grpc.login",
//!     GroupOptions::new()
//!         .ttl(Duration::from_secs(600))
//!         .initial_interval(Duration::from_secs(5)),
//! );
//!
//! let session = controller.get_for_group("10.0.0.1", "grpc.login");
//! if session.is_allowed() {
//!     // authentication failed
//!     session.increment();
//!     if session.counter() > 1 {
//!         session.add_backoff();
//!     }
//! }
//!
//! controller.stop(Duration::from_secs(1)).await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod penalty;

pub use config::PenaltyBoxConfig;
pub use error::{PenaltyBoxError, Result};
pub use penalty::{
    Controller, ControllerOptions, GroupConfig, GroupOptions, Session, SessionKey, DEFAULT_GROUP,
};
