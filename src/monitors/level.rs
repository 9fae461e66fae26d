//! Level check monitor: samples a static condition at startup and on every
//! host power-on (CPU presence, CPU mismatch).

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::HostPowerState;
use crate::hardware::gpio::SignalLine;

use super::{FaultBehavior, MonitorState};

pub struct LevelMonitor {
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    status: watch::Sender<MonitorState>,
}

impl LevelMonitor {
    pub fn new(
        line: Box<dyn SignalLine>,
        behavior: Box<dyn FaultBehavior>,
    ) -> (Self, watch::Receiver<MonitorState>) {
        let initial = match line.is_asserted() {
            Ok(true) => MonitorState::Asserted,
            Ok(false) => MonitorState::Idle,
            Err(e) => {
                warn!("Failed to read {} at construction: {e}", line.name());
                MonitorState::Idle
            }
        };
        let (status, status_rx) = watch::channel(initial);
        (
            Self {
                line,
                behavior,
                status,
            },
            status_rx,
        )
    }

    pub async fn run(
        mut self,
        mut power: watch::Receiver<HostPowerState>,
        shutdown: CancellationToken,
    ) {
        debug!("Checking {}", self.line.name());
        self.check().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = power.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *power.borrow_and_update();
                    if state.on {
                        self.check().await;
                    }
                }
            }
        }
    }

    async fn check(&mut self) {
        match self.line.is_asserted() {
            Ok(true) => {
                self.status.send_replace(MonitorState::Asserted);
                self.behavior.on_assert().await;
            }
            Ok(false) => {
                self.status.send_replace(MonitorState::Idle);
            }
            Err(e) => warn!("Failed to read {}: {e}", self.line.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::testing::{FaultEvent, MockLine, RecordingBehavior};
    use std::time::Duration;

    #[tokio::test]
    async fn test_asserted_at_startup_fires_once() {
        let (line, _handle) = MockLine::new("CPU2_PRESENCE", true);
        let (behavior, events) = RecordingBehavior::new("CPU2_PRESENCE");
        let (monitor, status) = LevelMonitor::new(Box::new(line), Box::new(behavior));

        assert_eq!(*status.borrow(), MonitorState::Asserted);

        let (_power_tx, power_rx) = watch::channel(HostPowerState::off());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(power_rx, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*events.lock().unwrap(), vec![FaultEvent::Assert]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rechecked_on_every_power_on() {
        let (line, handle) = MockLine::new("CPU2_MISMATCH", false);
        let (behavior, events) = RecordingBehavior::new("CPU2_MISMATCH");
        let (monitor, status) = LevelMonitor::new(Box::new(line), Box::new(behavior));

        let (power_tx, power_rx) = watch::channel(HostPowerState::off());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(power_rx, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(events.lock().unwrap().is_empty());

        // The condition appears while the host is off; the next power-on
        // observes it.
        handle.set(true);
        power_tx.send_replace(HostPowerState {
            on: true,
            generation: 1,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*events.lock().unwrap(), vec![FaultEvent::Assert]);
        assert_eq!(*status.borrow(), MonitorState::Asserted);

        // Still asserted on the following power-on: reported again.
        power_tx.send_replace(HostPowerState {
            on: true,
            generation: 2,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![FaultEvent::Assert, FaultEvent::Assert]
        );

        shutdown.cancel();
        task.await.unwrap();
    }
}
