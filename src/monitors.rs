//! Monitor engines: generic state machines driving per-fault strategies.
//!
//! Three engines cover every configured fault signal: `EdgeMonitor` reacts to
//! raw transitions, `PollMonitor` escalates a sustained assertion past a
//! timeout, `LevelMonitor` samples a static condition at startup and on every
//! host power-on. Each monitor runs as one task owned by the registry; all of
//! its state is task-local and its handlers are awaited inline, so handlers
//! never run reentrantly and events are handled in arrival order.

pub mod edge;
pub mod faults;
pub mod level;
pub mod poll;
pub mod regdump;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Observable state of one monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    ArmedWaitingEdge,
    Polling,
    Asserted,
}

/// What an escalating monitor does on ticks after its deadline has already
/// fired. Platforms differ on whether a stuck line should keep re-reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCadence {
    /// Escalate once per assertion episode, then only watch for deassertion.
    #[default]
    Once,
    /// Re-fire the escalation handler on every poll tick past the deadline.
    EveryInterval,
}

/// Per-fault strategy driven by an engine. Handlers run on state transitions
/// only (and on each post-deadline tick under `EveryInterval`).
#[async_trait]
pub trait FaultBehavior: Send {
    /// Label used in log events.
    fn label(&self) -> &str;

    async fn on_assert(&mut self);

    async fn on_deassert(&mut self) {}
}

/// Runtime-adjustable escalation timeout, bounded by a fixed maximum.
/// Shared between the registry handle (setter side) and the poll monitor,
/// which reads it whenever it computes a fresh deadline.
#[derive(Debug)]
pub struct TimeoutCell {
    millis: AtomicU64,
    max_millis: u64,
}

impl TimeoutCell {
    pub fn new(millis: u64, max_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
            max_millis,
        }
    }

    pub fn millis(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis())
    }

    /// Request a new timeout. A request above the maximum is rejected and the
    /// value in effect is echoed back; a valid request takes effect on the
    /// next deadline computation.
    pub fn request(&self, requested: u64) -> u64 {
        if requested > self.max_millis {
            warn!(
                "Timeout update to {requested}ms rejected, cannot be greater than {}ms",
                self.max_millis
            );
            return self.millis();
        }
        self.millis.store(requested, Ordering::Relaxed);
        requested
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock signal lines and recording behaviors shared by the engine tests.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::hardware::gpio::{edge_from_level, Edge, LineError, SignalLine};

    use super::FaultBehavior;

    /// Test handle driving a `MockLine`.
    #[derive(Clone)]
    pub struct MockLineHandle {
        level: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<bool>,
    }

    impl MockLineHandle {
        /// Set the normalized level and queue the matching edge event.
        pub fn set(&self, asserted: bool) {
            self.level.store(asserted, Ordering::SeqCst);
            let _ = self.events.send(asserted);
        }
    }

    pub struct MockLine {
        name: String,
        level: Arc<AtomicBool>,
        events: mpsc::UnboundedReceiver<bool>,
    }

    impl MockLine {
        pub fn new(name: &str, asserted: bool) -> (Self, MockLineHandle) {
            let level = Arc::new(AtomicBool::new(asserted));
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = MockLineHandle {
                level: Arc::clone(&level),
                events: tx,
            };
            (
                Self {
                    name: name.to_string(),
                    level,
                    events: rx,
                },
                handle,
            )
        }
    }

    #[async_trait]
    impl SignalLine for MockLine {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_asserted(&self) -> Result<bool, LineError> {
            Ok(self.level.load(Ordering::SeqCst))
        }

        async fn wait_for_edge(&mut self) -> Result<Edge, LineError> {
            match self.events.recv().await {
                Some(level) => Ok(edge_from_level(level)),
                None => std::future::pending().await,
            }
        }

        async fn flush_events(&mut self) {
            while self.events.try_recv().is_ok() {}
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FaultEvent {
        Assert,
        Deassert,
    }

    /// Behavior that records every handler invocation.
    pub struct RecordingBehavior {
        label: String,
        events: Arc<Mutex<Vec<FaultEvent>>>,
    }

    impl RecordingBehavior {
        pub fn new(label: &str) -> (Self, Arc<Mutex<Vec<FaultEvent>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    label: label.to_string(),
                    events: Arc::clone(&events),
                },
                events,
            )
        }
    }

    #[async_trait]
    impl FaultBehavior for RecordingBehavior {
        fn label(&self) -> &str {
            &self.label
        }

        async fn on_assert(&mut self) {
            self.events.lock().unwrap().push(FaultEvent::Assert);
        }

        async fn on_deassert(&mut self) {
            self.events.lock().unwrap().push(FaultEvent::Deassert);
        }
    }
}
