//! Per-fault behaviors: the reporting and corrective logic each monitor
//! engine drives on assertion.
//!
//! Every behavior here owns the services it needs (decoder, orchestrator,
//! alert sink) so the engines stay free of fault-specific knowledge.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::bus::{AlertSink, PowerControl};
use crate::config::types::SmiPolicy;
use crate::decode::{Classification, DiagnosticDecoder, FaultRecord, FaultSource};
use crate::hardware::gpio::SignalLine;
use crate::recovery::{RecoveryAction, RecoveryOrchestrator};

use super::FaultBehavior;

pub const BEEP_CPU_MISSING: u8 = 3;
pub const BEEP_CPU_IERR: u8 = 4;

/// Catastrophic error on the shared or per-CPU CATERR line.
pub struct CaterrBehavior {
    label: String,
    message: String,
}

impl CaterrBehavior {
    pub fn new(cpu: Option<usize>) -> Self {
        let message = match cpu {
            Some(cpu) => format!("CATERR on CPU{cpu}"),
            None => "CATERR on one of the CPUs".to_string(),
        };
        Self {
            label: "CATERR".to_string(),
            message,
        }
    }
}

#[async_trait]
impl FaultBehavior for CaterrBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: {}", self.message);
    }
}

/// Machine-check error, per CPU.
pub struct McerrBehavior {
    label: String,
    cpu: usize,
}

impl McerrBehavior {
    pub fn new(cpu: usize) -> Self {
        Self {
            label: format!("CPU {cpu} MCERR"),
            cpu,
        }
    }
}

#[async_trait]
impl FaultBehavior for McerrBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: MCERR on CPU {}", self.cpu);
    }
}

/// Shared error pin held asserted past its timeout. Attribution names the
/// implicated sockets; beeps, capture, and recovery are per-pin policy.
pub struct ErrPinBehavior {
    label: String,
    pin: u8,
    decoder: Arc<DiagnosticDecoder>,
    orchestrator: Arc<RecoveryOrchestrator>,
    power: Arc<dyn PowerControl>,
    alerts: Arc<dyn AlertSink>,
    beep: Option<u8>,
    capture: bool,
    recovery: RecoveryAction,
}

impl ErrPinBehavior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pin: u8,
        decoder: Arc<DiagnosticDecoder>,
        orchestrator: Arc<RecoveryOrchestrator>,
        power: Arc<dyn PowerControl>,
        alerts: Arc<dyn AlertSink>,
        beep: Option<u8>,
        capture: bool,
        recovery: RecoveryAction,
    ) -> Self {
        Self {
            label: format!("ERR{pin}"),
            pin,
            decoder,
            orchestrator,
            power,
            alerts,
            beep,
            capture,
            recovery,
        }
    }
}

#[async_trait]
impl FaultBehavior for ErrPinBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        let record = self.decoder.attribute(FaultSource::ErrPin(self.pin)).await;
        if record.is_empty() {
            error!("HostError: ERR{} Timeout", self.pin);
        } else {
            for fault in &record.classifications {
                error!("HostError: ERR{} Timeout on CPU {}", self.pin, fault.cpu + 1);
            }
        }

        if let Some(priority) = self.beep {
            if let Err(e) = self.alerts.beep(priority).await {
                warn!("Failed to beep for {}: {e}", self.label);
            }
        }

        let trigger = format!("ERR{} Timeout", self.pin);
        if self.capture {
            self.orchestrator
                .start_capture_and_recover(&trigger, self.recovery)
                .await;
        } else {
            apply_direct(self.power.as_ref(), self.recovery).await;
        }
    }
}

/// IERR held past its timeout: attribute, sub-classify, beep, then capture
/// diagnostics before the configured recovery.
pub struct IerrBehavior {
    label: String,
    decoder: Arc<DiagnosticDecoder>,
    orchestrator: Arc<RecoveryOrchestrator>,
    alerts: Arc<dyn AlertSink>,
    recovery: RecoveryAction,
}

impl IerrBehavior {
    pub fn new(
        decoder: Arc<DiagnosticDecoder>,
        orchestrator: Arc<RecoveryOrchestrator>,
        alerts: Arc<dyn AlertSink>,
        recovery: RecoveryAction,
    ) -> Self {
        Self {
            label: "IERR".to_string(),
            decoder,
            orchestrator,
            alerts,
            recovery,
        }
    }

    fn log_record(record: &FaultRecord) {
        if record.is_empty() {
            error!("HostError: IERR");
            return;
        }
        for fault in &record.classifications {
            match fault.classification {
                Classification::Unclassified => {
                    error!("HostError: IERR on CPU {}", fault.cpu + 1);
                }
                classification => {
                    error!("HostError: {classification} IERR on CPU {}", fault.cpu + 1);
                }
            }
        }
    }
}

#[async_trait]
impl FaultBehavior for IerrBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        let record = self.decoder.attribute(FaultSource::Ierr).await;
        Self::log_record(&record);

        if let Err(e) = self.alerts.beep(BEEP_CPU_IERR).await {
            warn!("Failed to beep for IERR: {e}");
        }

        self.orchestrator
            .start_capture_and_recover("IERR", self.recovery)
            .await;
    }
}

/// System-management interrupt stuck past its timeout.
pub struct SmiBehavior {
    label: String,
    policy: SmiPolicy,
    recovery: RecoveryAction,
    orchestrator: Arc<RecoveryOrchestrator>,
    power: Arc<dyn PowerControl>,
}

impl SmiBehavior {
    pub fn new(
        policy: SmiPolicy,
        recovery: RecoveryAction,
        orchestrator: Arc<RecoveryOrchestrator>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self {
            label: "SMI".to_string(),
            policy,
            recovery,
            orchestrator,
            power,
        }
    }
}

#[async_trait]
impl FaultBehavior for SmiBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: SMI Timeout");
        match self.policy {
            SmiPolicy::CaptureThenRecover => {
                self.orchestrator
                    .start_capture_and_recover("SMI Timeout", self.recovery)
                    .await;
            }
            SmiPolicy::DirectRecover => {
                apply_direct(self.power.as_ref(), self.recovery).await;
            }
        }
    }
}

/// CPU thermal trip. A companion FIVR fault line, read at the moment of the
/// trip, distinguishes a failed power-on from a true thermal event.
pub struct CpuThermtripBehavior {
    label: String,
    cpu: usize,
    fivr_line: Option<Box<dyn SignalLine>>,
}

impl CpuThermtripBehavior {
    pub fn new(cpu: usize, fivr_line: Option<Box<dyn SignalLine>>) -> Self {
        Self {
            label: format!("CPU {cpu} thermtrip"),
            cpu,
            fivr_line,
        }
    }

    fn fivr_faulted(&self) -> bool {
        match &self.fivr_line {
            Some(line) => match line.is_asserted() {
                Ok(asserted) => asserted,
                Err(e) => {
                    warn!("Failed to read {}: {e}", line.name());
                    false
                }
            },
            None => false,
        }
    }
}

#[async_trait]
impl FaultBehavior for CpuThermtripBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        if self.fivr_faulted() {
            error!("HostError: Boot FIVR Fault on CPU {}", self.cpu);
        } else {
            error!("HostError: CPU {} thermal trip", self.cpu);
        }
    }
}

pub struct MemThermtripBehavior {
    label: String,
    cpu: usize,
}

impl MemThermtripBehavior {
    pub fn new(cpu: usize) -> Self {
        Self {
            label: format!("CPU {cpu} memory thermtrip"),
            cpu,
        }
    }
}

#[async_trait]
impl FaultBehavior for MemThermtripBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: CPU {} Memory Thermal trip.", self.cpu);
    }
}

pub struct PchThermtripBehavior {
    label: String,
}

impl PchThermtripBehavior {
    pub fn new() -> Self {
        Self {
            label: "PCH thermtrip".to_string(),
        }
    }
}

impl Default for PchThermtripBehavior {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FaultBehavior for PchThermtripBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: SSB thermal trip");
    }
}

pub struct VrHotBehavior {
    label: String,
    vr_name: String,
}

impl VrHotBehavior {
    pub fn new(vr_name: &str) -> Self {
        Self {
            label: format!("{vr_name} VRHOT"),
            vr_name: vr_name.to_string(),
        }
    }
}

#[async_trait]
impl FaultBehavior for VrHotBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: {} Voltage Regulator Overheated.", self.vr_name);
    }
}

/// CPLD CRC error, gated on CPU presence: an absent CPU floats the line, so
/// its assertions are noise. The presence line uses the same normalization as
/// the presence monitor, asserted meaning the socket is empty.
pub struct CpldCrcBehavior {
    label: String,
    cpu: usize,
    presence: Box<dyn SignalLine>,
}

impl CpldCrcBehavior {
    pub fn new(cpu: usize, presence: Box<dyn SignalLine>) -> Self {
        Self {
            label: format!("CPU {cpu} CPLD CRC"),
            cpu,
            presence,
        }
    }

    fn cpu_present(&self) -> bool {
        match self.presence.is_asserted() {
            Ok(missing) => !missing,
            Err(e) => {
                warn!("Failed to read {}: {e}", self.presence.name());
                false
            }
        }
    }
}

#[async_trait]
impl FaultBehavior for CpldCrcBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        if self.cpu_present() {
            error!("HostError: CPU {} CPLD CRC error.", self.cpu);
        }
    }
}

/// CPU socket empty at power-on.
pub struct CpuPresenceBehavior {
    label: String,
    cpu: usize,
    alerts: Arc<dyn AlertSink>,
}

impl CpuPresenceBehavior {
    pub fn new(cpu: usize, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            label: format!("CPU {cpu} presence"),
            cpu,
            alerts,
        }
    }
}

#[async_trait]
impl FaultBehavior for CpuPresenceBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: CPU {} missing", self.cpu);
        if let Err(e) = self.alerts.beep(BEEP_CPU_MISSING).await {
            warn!("Failed to beep for CPU {} missing: {e}", self.cpu);
        }
    }
}

/// Mixed CPU SKUs detected at power-on.
pub struct CpuMismatchBehavior {
    label: String,
    cpu: usize,
}

impl CpuMismatchBehavior {
    pub fn new(cpu: usize) -> Self {
        Self {
            label: format!("CPU {cpu} mismatch"),
            cpu,
        }
    }
}

#[async_trait]
impl FaultBehavior for CpuMismatchBehavior {
    fn label(&self) -> &str {
        &self.label
    }

    async fn on_assert(&mut self) {
        error!("HostError: CPU {} mismatch", self.cpu);
    }
}

async fn apply_direct(power: &dyn PowerControl, action: RecoveryAction) {
    match action {
        RecoveryAction::None => {}
        RecoveryAction::WarmReset => {
            if let Err(e) = power.request_warm_reset().await {
                error!("Failed to request warm reset: {e}");
            }
        }
        RecoveryAction::PowerCycle => {
            if let Err(e) = power.request_power_cycle().await {
                error!("Failed to request power cycle: {e}");
            }
        }
    }
}
