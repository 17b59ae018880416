//! Observers a download reports into. The engine never prints; hosts decide.

use tracing::info;

/// Receives overall progress (0..=100), non-decreasing within one download.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8);
}

/// Receives human-readable download events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, percent: u8) {
        info!(target: "swarm::download", percent, "progress");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn on_event(&self, message: &str) {
        info!(target: "swarm::download", "{message}");
    }
}
