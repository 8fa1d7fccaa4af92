//! # churnwatch
//!
//! Membership churn alerting and digest scheduling for tracked communities.
//!
//! churnwatch watches join and leave events for the channels it tracks and
//! tells channel operators when something unusual happens, plus a periodic
//! growth summary.
//!
//! ## Architecture
//!
//! - **Alerting**: windowed counters, the alert evaluator, digest scheduling
//!   and the orchestrator that serializes work per channel
//! - **Storage**: PostgreSQL via sqlx, or an in-process store for tests
//! - **API**: REST API for event ingestion and per-channel settings
//!
//! ## Quick Start
//!
//! ```bash
//! # Apply migrations
//! churnwatch db migrate
//!
//! # Run the API and the digest sweep loop
//! churnwatch serve
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertOrchestrator, Notifier, SweepReport};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
