//! Fault registry: builds and owns one monitor task per configured fault.
//!
//! The registry translates each config entry into an engine plus behavior,
//! opening the signal lines through an injected factory so the whole build
//! can run against mock lines in tests. A line that fails to open excludes
//! that monitor with a warning; the daemon keeps running with the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{
    AlertSink, DumpSink, HostPowerState, PowerControl, TemperatureSource,
};
use crate::config::types::{Config, EscalationConfig, MonitorEntry};
use crate::decode::DiagnosticDecoder;
use crate::hardware::gpio::{LineError, Polarity, SignalLine};
use crate::hardware::peci::SocketAccess;
use crate::monitors::edge::EdgeMonitor;
use crate::monitors::faults::{
    CaterrBehavior, CpldCrcBehavior, CpuMismatchBehavior, CpuPresenceBehavior,
    CpuThermtripBehavior, ErrPinBehavior, IerrBehavior, McerrBehavior, MemThermtripBehavior,
    PchThermtripBehavior, SmiBehavior, VrHotBehavior,
};
use crate::monitors::level::LevelMonitor;
use crate::monitors::poll::PollMonitor;
use crate::monitors::regdump::RegisterDumpMonitor;
use crate::monitors::{FaultBehavior, MonitorState, TimeoutCell};
use crate::recovery::RecoveryOrchestrator;

/// Factory opening a named line with the requested normalization.
pub type LineFactory<'a> =
    &'a dyn Fn(&str, Polarity) -> Result<Box<dyn SignalLine>, LineError>;

/// Services the behaviors draw on, shared across all monitors.
pub struct Services {
    pub decoder: Arc<DiagnosticDecoder>,
    pub orchestrator: Arc<RecoveryOrchestrator>,
    pub power: Arc<dyn PowerControl>,
    pub alerts: Arc<dyn AlertSink>,
    pub access: Arc<dyn SocketAccess>,
    pub dumps: Arc<dyn DumpSink>,
    pub temperatures: Arc<dyn TemperatureSource>,
}

/// Handle to one running monitor.
pub struct MonitorHandle {
    pub status: watch::Receiver<MonitorState>,
    /// Present on monitors with a runtime-adjustable escalation timeout.
    pub timeout: Option<Arc<TimeoutCell>>,
    task: JoinHandle<()>,
}

pub struct FaultRegistry {
    monitors: HashMap<String, MonitorHandle>,
    regdump: Option<JoinHandle<()>>,
}

impl FaultRegistry {
    /// Build and spawn every configured monitor. Returns the registry even
    /// when individual lines fail to open; a registry with zero monitors is
    /// an error.
    pub fn build(
        config: &Config,
        services: &Services,
        open_line: LineFactory<'_>,
        power: watch::Receiver<HostPowerState>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let mut monitors = HashMap::new();

        for entry in &config.monitors {
            let fault_id = entry.fault_id();
            match spawn_monitor(entry, services, open_line, power.clone(), shutdown) {
                Ok(handle) => {
                    monitors.insert(fault_id, handle);
                }
                Err(e) => {
                    warn!("Excluding monitor {fault_id}: {e}");
                }
            }
        }

        if monitors.is_empty() {
            anyhow::bail!("no monitor could be started");
        }
        info!("Started {} fault monitors", monitors.len());

        let regdump = config.register_dump.clone().map(|dump_config| {
            let monitor = RegisterDumpMonitor::new(
                dump_config,
                Arc::clone(&services.access),
                Arc::clone(&services.dumps),
                Arc::clone(&services.temperatures),
            );
            tokio::spawn(monitor.run(shutdown.child_token()))
        });

        Ok(Self { monitors, regdump })
    }

    pub fn monitor(&self, fault_id: &str) -> Option<&MonitorHandle> {
        self.monitors.get(fault_id)
    }

    pub fn fault_ids(&self) -> impl Iterator<Item = &str> {
        self.monitors.keys().map(String::as_str)
    }

    /// Request a new escalation timeout on a monitor that carries one.
    /// Returns the value now in effect.
    pub fn request_timeout(&self, fault_id: &str, millis: u64) -> Option<u64> {
        self.monitors
            .get(fault_id)?
            .timeout
            .as_ref()
            .map(|cell| cell.request(millis))
    }

    /// Wait for every monitor task to finish after shutdown was signaled.
    pub async fn join(self) {
        for (fault_id, handle) in self.monitors {
            if let Err(e) = handle.task.await {
                warn!("Monitor {fault_id} task failed: {e}");
            }
        }
        if let Some(task) = self.regdump {
            if let Err(e) = task.await {
                warn!("Register dump task failed: {e}");
            }
        }
    }
}

fn spawn_monitor(
    entry: &MonitorEntry,
    services: &Services,
    open_line: LineFactory<'_>,
    power: watch::Receiver<HostPowerState>,
    shutdown: &CancellationToken,
) -> Result<MonitorHandle, LineError> {
    let shutdown = shutdown.child_token();

    match entry {
        MonitorEntry::Caterr { line, cpu } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            spawn_edge(line, Box::new(CaterrBehavior::new(*cpu)), shutdown)
        }
        MonitorEntry::Mcerr {
            line,
            cpu,
            polarity,
        } => {
            let line = open_line(line, *polarity)?;
            spawn_edge(line, Box::new(McerrBehavior::new(*cpu)), shutdown)
        }
        MonitorEntry::ErrPin {
            line,
            pin,
            escalation,
            beep,
            capture,
            recovery,
        } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            let behavior = ErrPinBehavior::new(
                *pin,
                Arc::clone(&services.decoder),
                Arc::clone(&services.orchestrator),
                Arc::clone(&services.power),
                Arc::clone(&services.alerts),
                *beep,
                *capture,
                *recovery,
            );
            spawn_poll(
                line,
                Box::new(behavior),
                escalation,
                escalation.timeout_ms,
                power,
                shutdown,
            )
        }
        MonitorEntry::Ierr {
            line,
            escalation,
            max_timeout_ms,
            recovery,
        } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            let behavior = IerrBehavior::new(
                Arc::clone(&services.decoder),
                Arc::clone(&services.orchestrator),
                Arc::clone(&services.alerts),
                *recovery,
            );
            spawn_poll(
                line,
                Box::new(behavior),
                escalation,
                *max_timeout_ms,
                power,
                shutdown,
            )
        }
        MonitorEntry::Smi {
            line,
            escalation,
            policy,
            recovery,
        } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            let behavior = SmiBehavior::new(
                *policy,
                *recovery,
                Arc::clone(&services.orchestrator),
                Arc::clone(&services.power),
            );
            spawn_poll(
                line,
                Box::new(behavior),
                escalation,
                escalation.timeout_ms,
                power,
                shutdown,
            )
        }
        MonitorEntry::CpuThermtrip {
            line,
            cpu,
            fivr_line,
        } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            let fivr = match fivr_line {
                Some(name) => match open_line(name, Polarity::ActiveLow) {
                    Ok(fivr) => Some(fivr),
                    Err(e) => {
                        warn!("FIVR fault line {name} unavailable: {e}");
                        None
                    }
                },
                None => None,
            };
            spawn_edge(
                line,
                Box::new(CpuThermtripBehavior::new(*cpu, fivr)),
                shutdown,
            )
        }
        MonitorEntry::MemThermtrip { line, cpu } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            spawn_edge(line, Box::new(MemThermtripBehavior::new(*cpu)), shutdown)
        }
        MonitorEntry::PchThermtrip { line } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            spawn_edge(line, Box::new(PchThermtripBehavior::new()), shutdown)
        }
        MonitorEntry::VrHot { line, vr_name } => {
            let line = open_line(line, Polarity::ActiveLow)?;
            spawn_edge(line, Box::new(VrHotBehavior::new(vr_name)), shutdown)
        }
        MonitorEntry::CpldCrc {
            line,
            cpu,
            presence_line,
        } => {
            let line = open_line(line, Polarity::ActiveHigh)?;
            // Same normalization as the presence monitor: asserted = missing.
            let presence = open_line(presence_line, Polarity::ActiveHigh)?;
            spawn_edge(
                line,
                Box::new(CpldCrcBehavior::new(*cpu, presence)),
                shutdown,
            )
        }
        MonitorEntry::CpuPresence { line, cpu } => {
            // The raw presence pin is low when populated; asserted = missing.
            let line = open_line(line, Polarity::ActiveHigh)?;
            let behavior = CpuPresenceBehavior::new(*cpu, Arc::clone(&services.alerts));
            spawn_level(line, Box::new(behavior), power, shutdown)
        }
        MonitorEntry::CpuMismatch { line, cpu } => {
            let line = open_line(line, Polarity::ActiveHigh)?;
            spawn_level(
                line,
                Box::new(CpuMismatchBehavior::new(*cpu)),
                power,
                shutdown,
            )
        }
    }
}

fn spawn_edge(
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    shutdown: CancellationToken,
) -> Result<MonitorHandle, LineError> {
    let (monitor, status) = EdgeMonitor::new(line, behavior);
    Ok(MonitorHandle {
        status,
        timeout: None,
        task: tokio::spawn(monitor.run(shutdown)),
    })
}

fn spawn_poll(
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    escalation: &EscalationConfig,
    max_timeout_ms: u64,
    power: watch::Receiver<HostPowerState>,
    shutdown: CancellationToken,
) -> Result<MonitorHandle, LineError> {
    let timeout = Arc::new(TimeoutCell::new(escalation.timeout_ms, max_timeout_ms));
    let (monitor, status) = PollMonitor::new(
        line,
        behavior,
        Duration::from_millis(escalation.poll_interval_ms),
        Arc::clone(&timeout),
        escalation.cadence,
    );
    Ok(MonitorHandle {
        status,
        timeout: Some(timeout),
        task: tokio::spawn(monitor.run(power, shutdown)),
    })
}

fn spawn_level(
    line: Box<dyn SignalLine>,
    behavior: Box<dyn FaultBehavior>,
    power: watch::Receiver<HostPowerState>,
    shutdown: CancellationToken,
) -> Result<MonitorHandle, LineError> {
    let (monitor, status) = LevelMonitor::new(line, behavior);
    Ok(MonitorHandle {
        status,
        timeout: None,
        task: tokio::spawn(monitor.run(power, shutdown)),
    })
}
