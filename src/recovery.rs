//! Recovery orchestration: capture diagnostics, then conditionally recover.
//!
//! At most one capture is outstanding at a time. A fault arriving while one
//! is in flight only overwrites the pending recovery action (last-write-wins)
//! instead of starting a second capture; the action applied on completion is
//! whatever is pending at that moment.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::bus::{CrashdumpControl, PowerControl};

/// Corrective step applied after diagnostic capture completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    #[default]
    None,
    WarmReset,
    PowerCycle,
}

#[derive(Debug)]
struct PendingRecovery {
    trigger: String,
    action: RecoveryAction,
}

pub struct RecoveryOrchestrator {
    capture: Arc<dyn CrashdumpControl>,
    power: Arc<dyn PowerControl>,
    completions: broadcast::Sender<()>,
    pending: Mutex<Option<PendingRecovery>>,
}

impl RecoveryOrchestrator {
    /// `completions` carries the external capture-completion signal; the
    /// orchestrator subscribes to it once per capture it starts.
    pub fn new(
        capture: Arc<dyn CrashdumpControl>,
        power: Arc<dyn PowerControl>,
        completions: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            capture,
            power,
            completions,
            pending: Mutex::new(None),
        })
    }

    /// Start a capture and apply `action` when it completes. With a capture
    /// already in flight, only the pending action is replaced.
    pub async fn start_capture_and_recover(
        self: &Arc<Self>,
        trigger: &str,
        action: RecoveryAction,
    ) {
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(in_flight) = pending.as_mut() {
                info!(
                    "Crashdump already in progress for {}, updating recovery action to {action:?}",
                    in_flight.trigger
                );
                in_flight.action = action;
                return;
            }
            *pending = Some(PendingRecovery {
                trigger: trigger.to_string(),
                action,
            });
        }

        // Subscribe before the start call so a prompt completion cannot slip
        // past the waiter.
        let completions = self.completions.subscribe();

        info!("Starting crashdump for {trigger}");
        if let Err(e) = self.capture.generate_stored_log(trigger).await {
            // A rejected submission must not leave the orchestrator stuck in
            // progress.
            error!("Failed to start crashdump for {trigger}: {e}");
            self.pending.lock().unwrap().take();
            return;
        }

        tokio::spawn(Arc::clone(self).recover_on_completion(completions));
    }

    async fn recover_on_completion(self: Arc<Self>, mut completions: broadcast::Receiver<()>) {
        if let Err(e) = completions.recv().await {
            warn!("Capture completion stream lost: {e}");
            self.pending.lock().unwrap().take();
            return;
        }

        let Some(pending) = self.pending.lock().unwrap().take() else {
            return;
        };
        info!("Crashdump completed for {}", pending.trigger);

        match pending.action {
            RecoveryAction::None => {
                info!(
                    "No recovery configured for {}, leaving system in failed state",
                    pending.trigger
                );
            }
            RecoveryAction::WarmReset => {
                info!("Recovering the system: warm reset");
                if let Err(e) = self.power.request_warm_reset().await {
                    error!("Failed to request warm reset: {e}");
                }
            }
            RecoveryAction::PowerCycle => {
                info!("Recovering the system: power cycle");
                if let Err(e) = self.power.request_power_cycle().await {
                    error!("Failed to request power cycle: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockCapture {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl CrashdumpControl for MockCapture {
        async fn generate_stored_log(&self, _trigger: &str) -> Result<(), BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                Err(BusError::Call("rejected".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct MockPower {
        warm_resets: AtomicUsize,
        power_cycles: AtomicUsize,
    }

    #[async_trait]
    impl PowerControl for MockPower {
        async fn host_is_on(&self) -> Result<bool, BusError> {
            Ok(true)
        }

        async fn request_warm_reset(&self) -> Result<(), BusError> {
            self.warm_resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn request_power_cycle(&self) -> Result<(), BusError> {
            self.power_cycles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn orchestrator(
        reject: bool,
    ) -> (
        Arc<RecoveryOrchestrator>,
        Arc<MockCapture>,
        Arc<MockPower>,
        broadcast::Sender<()>,
    ) {
        let capture = Arc::new(MockCapture {
            reject,
            ..Default::default()
        });
        let power = Arc::new(MockPower::default());
        let (completions, _) = broadcast::channel(4);
        let orchestrator = RecoveryOrchestrator::new(
            Arc::clone(&capture) as Arc<dyn CrashdumpControl>,
            Arc::clone(&power) as Arc<dyn PowerControl>,
            completions.clone(),
        );
        (orchestrator, capture, power, completions)
    }

    #[tokio::test]
    async fn test_overlapping_requests_coalesce_to_one_capture() {
        let (orchestrator, capture, power, completions) = orchestrator(false);

        orchestrator
            .start_capture_and_recover("IERR", RecoveryAction::None)
            .await;
        orchestrator
            .start_capture_and_recover("IERR", RecoveryAction::WarmReset)
            .await;

        assert_eq!(capture.calls.load(Ordering::SeqCst), 1);

        completions.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The later request's action won, applied exactly once.
        assert_eq!(power.warm_resets.load(Ordering::SeqCst), 1);
        assert_eq!(power.power_cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completion_clears_in_flight_for_next_fault() {
        let (orchestrator, capture, power, completions) = orchestrator(false);

        orchestrator
            .start_capture_and_recover("ERR2 Timeout", RecoveryAction::PowerCycle)
            .await;
        completions.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(power.power_cycles.load(Ordering::SeqCst), 1);

        // A fresh fault starts a fresh capture.
        orchestrator
            .start_capture_and_recover("ERR2 Timeout", RecoveryAction::PowerCycle)
            .await;
        assert_eq!(capture.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_submission_does_not_stick_in_progress() {
        let (orchestrator, capture, _power, _completions) = orchestrator(true);

        orchestrator
            .start_capture_and_recover("SMI Timeout", RecoveryAction::WarmReset)
            .await;
        orchestrator
            .start_capture_and_recover("SMI Timeout", RecoveryAction::WarmReset)
            .await;

        // Each request reached the capture service: the failed submission
        // cleared the in-flight state instead of swallowing the second call.
        assert_eq!(capture.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_none_action_leaves_system_alone() {
        let (orchestrator, _capture, power, completions) = orchestrator(false);

        orchestrator
            .start_capture_and_recover("IERR", RecoveryAction::None)
            .await;
        completions.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(power.warm_resets.load(Ordering::SeqCst), 0);
        assert_eq!(power.power_cycles.load(Ordering::SeqCst), 0);
    }
}
