//! Edge monitor: dispatches the fault strategy on raw signal transitions.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hardware::gpio::SignalLine;

use super::{FaultBehavior, MonitorState};

/// Backoff after a failed edge wait so a broken line cannot spin the task.
const EDGE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

enum Wake {
    Shutdown,
    Edge,
    EdgeError,
}

pub struct EdgeMonitor {
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    status: watch::Sender<MonitorState>,
    asserted: bool,
}

impl EdgeMonitor {
    /// Build the monitor with an immediate synchronous check of the current
    /// level, so an already-asserted condition is observable right away. The
    /// matching handler runs at the start of `run`.
    pub fn new(
        line: Box<dyn SignalLine>,
        behavior: Box<dyn FaultBehavior>,
    ) -> (Self, watch::Receiver<MonitorState>) {
        let asserted = match line.is_asserted() {
            Ok(level) => level,
            Err(e) => {
                warn!("Failed to read {} at construction: {e}", line.name());
                false
            }
        };
        let initial = if asserted {
            MonitorState::Asserted
        } else {
            MonitorState::ArmedWaitingEdge
        };
        let (status, status_rx) = watch::channel(initial);
        (
            Self {
                line,
                behavior,
                status,
                asserted,
            },
            status_rx,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Monitoring {}", self.line.name());

        if self.asserted {
            self.behavior.on_assert().await;
        }

        loop {
            let wake = {
                let line = &mut self.line;
                tokio::select! {
                    _ = shutdown.cancelled() => Wake::Shutdown,
                    edge = line.wait_for_edge() => match edge {
                        Ok(_) => Wake::Edge,
                        Err(e) => {
                            warn!("{} wait error: {e}", line.name());
                            Wake::EdgeError
                        }
                    },
                }
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Edge => self.settle().await,
                Wake::EdgeError => tokio::time::sleep(EDGE_ERROR_BACKOFF).await,
            }
        }
        debug!("Stopped monitoring {}", self.line.name());
    }

    /// Dispatch transitions until the observed level matches the last
    /// reported one. Re-checking after each handler catches an edge that
    /// arrived while the handler ran, so no transition is lost.
    async fn settle(&mut self) {
        loop {
            let level = match self.line.is_asserted() {
                Ok(level) => level,
                Err(e) => {
                    warn!("Failed to read {}: {e}", self.line.name());
                    return;
                }
            };
            if level == self.asserted {
                return;
            }
            self.asserted = level;
            if level {
                self.status.send_replace(MonitorState::Asserted);
                self.behavior.on_assert().await;
            } else {
                self.status.send_replace(MonitorState::ArmedWaitingEdge);
                self.behavior.on_deassert().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::testing::{FaultEvent, MockLine, RecordingBehavior};
    use std::time::Duration;

    async fn settle_events() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_initial_state_matches_line_level() {
        let (line, _handle) = MockLine::new("CPU_CATERR", true);
        let (behavior, events) = RecordingBehavior::new("CATERR");
        let (monitor, status) = EdgeMonitor::new(Box::new(line), Box::new(behavior));

        assert_eq!(*status.borrow(), MonitorState::Asserted);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));
        settle_events().await;

        // The pre-existing assertion was not missed.
        assert_eq!(*events.lock().unwrap(), vec![FaultEvent::Assert]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_edges_dispatch_handlers_in_order() {
        let (line, handle) = MockLine::new("CPU_MCERR", false);
        let (behavior, events) = RecordingBehavior::new("MCERR");
        let (monitor, status) = EdgeMonitor::new(Box::new(line), Box::new(behavior));

        assert_eq!(*status.borrow(), MonitorState::ArmedWaitingEdge);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        handle.set(true);
        settle_events().await;
        assert_eq!(*status.borrow(), MonitorState::Asserted);

        handle.set(false);
        settle_events().await;
        assert_eq!(*status.borrow(), MonitorState::ArmedWaitingEdge);
        assert_eq!(
            *events.lock().unwrap(),
            vec![FaultEvent::Assert, FaultEvent::Deassert]
        );

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_level_recheck_collapses_stale_edges() {
        let (line, handle) = MockLine::new("CPU_MCERR", false);
        let (behavior, events) = RecordingBehavior::new("MCERR");
        let (monitor, _status) = EdgeMonitor::new(Box::new(line), Box::new(behavior));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        // Assert and deassert faster than the handler can observe. The
        // monitor settles on the final level without inventing transitions.
        handle.set(true);
        handle.set(false);
        settle_events().await;

        let recorded = events.lock().unwrap().clone();
        assert!(
            recorded == vec![FaultEvent::Assert, FaultEvent::Deassert] || recorded.is_empty(),
            "unexpected events: {recorded:?}"
        );

        shutdown.cancel();
        task.await.unwrap();
    }
}
