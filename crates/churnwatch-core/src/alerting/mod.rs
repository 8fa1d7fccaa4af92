//! Alerting engine for churnwatch
//!
//! Evaluates member events against per-channel thresholds, schedules digests,
//! and delivers both through a [`Notifier`].

mod digest;
mod evaluator;
mod locks;
mod notifier;
mod orchestrator;
mod scheduler;
mod window;

pub use digest::{AnalyticsDigestBuilder, DigestBuilder};
pub use evaluator::{classify_anomaly, reached_milestone, AlertEvaluator};
pub use locks::ChannelLocks;
pub use notifier::{
    escape_html, notifier_from_config, LogNotifier, MessageFormatter, Notifier, PlainFormatter,
    WebhookNotifier,
};
pub use orchestrator::{AlertOrchestrator, SweepReport};
pub use scheduler::DigestScheduler;
pub use window::{baseline_rate, ActivitySample, WindowedCounter};
