//! Escalating poll monitor: separates a transient assertion from a stuck
//! fault by polling an asserted line until it clears or a deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::HostPowerState;
use crate::hardware::gpio::{Edge, SignalLine};

use super::{EscalationCadence, FaultBehavior, MonitorState, TimeoutCell};

const EDGE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
enum Phase {
    Armed,
    Polling { deadline: Instant },
    Asserted,
}

impl Phase {
    fn state(self) -> MonitorState {
        match self {
            Phase::Armed => MonitorState::ArmedWaitingEdge,
            Phase::Polling { .. } => MonitorState::Polling,
            Phase::Asserted => MonitorState::Asserted,
        }
    }
}

enum Wake {
    Shutdown,
    Power(HostPowerState),
    Edge(Edge),
    EdgeError,
    Tick,
}

pub struct PollMonitor {
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    poll_interval: Duration,
    timeout: Arc<TimeoutCell>,
    cadence: EscalationCadence,
    status: watch::Sender<MonitorState>,
    phase: Phase,
}

impl PollMonitor {
    /// Build the monitor with an immediate synchronous level check: an
    /// already-asserted line goes straight into `Polling` with a deadline
    /// computed from now, so a pre-existing condition is never missed.
    pub fn new(
        line: Box<dyn SignalLine>,
        behavior: Box<dyn FaultBehavior>,
        poll_interval: Duration,
        timeout: Arc<TimeoutCell>,
        cadence: EscalationCadence,
    ) -> (Self, watch::Receiver<MonitorState>) {
        let phase = match line.is_asserted() {
            Ok(true) => Phase::Polling {
                deadline: Instant::now() + timeout.duration(),
            },
            Ok(false) => Phase::Armed,
            Err(e) => {
                warn!("Failed to read {} at construction: {e}", line.name());
                Phase::Armed
            }
        };
        let (status, status_rx) = watch::channel(phase.state());
        (
            Self {
                line,
                behavior,
                poll_interval,
                timeout,
                cadence,
                status,
                phase,
            },
            status_rx,
        )
    }

    pub async fn run(
        mut self,
        mut power: watch::Receiver<HostPowerState>,
        shutdown: CancellationToken,
    ) {
        debug!("Monitoring {}", self.line.name());

        loop {
            let wake = self.wait(&mut power, &shutdown).await;
            let next = match wake {
                Wake::Shutdown => break,
                Wake::Power(state) => {
                    // A power-on cancels any outstanding wait and forces an
                    // immediate re-poll with a fresh deadline; the canceled
                    // wait invokes no handler.
                    if state.on {
                        debug!("{}: host on, repolling", self.line.name());
                        self.fresh_polling()
                    } else {
                        self.phase
                    }
                }
                Wake::Edge(Edge::Rising) => self.fresh_polling(),
                Wake::Edge(Edge::Falling) => self.phase,
                Wake::EdgeError => {
                    tokio::time::sleep(EDGE_ERROR_BACKOFF).await;
                    self.phase
                }
                Wake::Tick => self.tick(&power).await,
            };
            self.enter(next);
        }
        debug!("Stopped monitoring {}", self.line.name());
    }

    /// Exactly one wait is outstanding at any time: an edge wait while armed,
    /// a poll timer otherwise. Both cancel cleanly on power or shutdown.
    async fn wait(
        &mut self,
        power: &mut watch::Receiver<HostPowerState>,
        shutdown: &CancellationToken,
    ) -> Wake {
        let armed = matches!(self.phase, Phase::Armed);
        let line = &mut self.line;
        let interval = self.poll_interval;
        tokio::select! {
            _ = shutdown.cancelled() => Wake::Shutdown,
            changed = power.changed() => match changed {
                Ok(()) => Wake::Power(*power.borrow_and_update()),
                Err(_) => Wake::Shutdown,
            },
            edge = line.wait_for_edge(), if armed => match edge {
                Ok(edge) => Wake::Edge(edge),
                Err(e) => {
                    warn!("{} wait error: {e}", line.name());
                    Wake::EdgeError
                }
            },
            _ = tokio::time::sleep(interval), if !armed => Wake::Tick,
        }
    }

    /// One poll tick while `Polling` or `Asserted`.
    async fn tick(&mut self, power: &watch::Receiver<HostPowerState>) -> Phase {
        self.line.flush_events().await;

        // While the host is off the signal reads as deasserted regardless of
        // raw level, masking spurious reads during power transitions.
        let asserted = power.borrow().on
            && match self.line.is_asserted() {
                Ok(level) => level,
                Err(e) => {
                    warn!("Failed to read {}: {e}", self.line.name());
                    false
                }
            };

        if !asserted {
            self.behavior.on_deassert().await;
            return Phase::Armed;
        }

        match self.phase {
            Phase::Polling { deadline } if Instant::now() > deadline => {
                info!(
                    "{} asserted for {} ms",
                    self.line.name(),
                    self.timeout.millis()
                );
                self.behavior.on_assert().await;
                match self.cadence {
                    EscalationCadence::Once => Phase::Asserted,
                    EscalationCadence::EveryInterval => Phase::Polling { deadline },
                }
            }
            phase => phase,
        }
    }

    fn fresh_polling(&self) -> Phase {
        Phase::Polling {
            deadline: Instant::now() + self.timeout.duration(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.status.send_if_modified(|state| {
            if *state == phase.state() {
                false
            } else {
                *state = phase.state();
                true
            }
        });
    }
}
