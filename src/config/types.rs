//! Configuration structs and the default platform monitor set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hardware::gpio::Polarity;
use crate::hardware::peci::{ClientAddr, MAX_CLIENT_ADDR, MIN_CLIENT_ADDR};
use crate::monitors::EscalationCadence;
use crate::recovery::RecoveryAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub peci: PeciConfig,
    #[serde(default = "default_monitors")]
    pub monitors: Vec<MonitorEntry>,
    #[serde(default)]
    pub register_dump: Option<RegisterDumpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            peci: PeciConfig::default(),
            monitors: default_monitors(),
            register_dump: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Socket address range scanned by the diagnostic decoder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeciConfig {
    pub min_addr: ClientAddr,
    pub max_addr: ClientAddr,
}

impl Default for PeciConfig {
    fn default() -> Self {
        Self {
            min_addr: MIN_CLIENT_ADDR,
            max_addr: MAX_CLIENT_ADDR,
        }
    }
}

/// Poll interval and escalation timeout of an escalating monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub cadence: EscalationCadence,
}

/// What the SMI monitor does on escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmiPolicy {
    /// Capture diagnostics first, then apply the recovery action.
    #[default]
    CaptureThenRecover,
    /// Skip the capture and recover directly.
    DirectRecover,
}

/// One configured fault monitor. CPU numbers are 1-based, matching the
/// platform signal names and log texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEntry {
    /// Catastrophic error, edge-driven, per-CPU line or shared.
    Caterr {
        line: String,
        #[serde(default)]
        cpu: Option<usize>,
    },
    /// Machine-check error, edge-driven, polarity wired per platform.
    Mcerr {
        line: String,
        cpu: usize,
        #[serde(default = "default_active_low")]
        polarity: Polarity,
    },
    /// Shared error pin ERRn with timeout escalation and socket attribution.
    ErrPin {
        line: String,
        pin: u8,
        #[serde(default = "default_err_pin_escalation")]
        escalation: EscalationConfig,
        /// Beep priority raised on escalation (ERR2 platforms use 5).
        #[serde(default)]
        beep: Option<u8>,
        /// Start a diagnostic capture on escalation.
        #[serde(default)]
        capture: bool,
        #[serde(default)]
        recovery: RecoveryAction,
    },
    /// IERR with full decode chain, capture/recovery and a runtime-adjustable
    /// escalation timeout.
    Ierr {
        line: String,
        #[serde(default = "default_ierr_escalation")]
        escalation: EscalationConfig,
        #[serde(default = "default_ierr_max_timeout_ms")]
        max_timeout_ms: u64,
        #[serde(default)]
        recovery: RecoveryAction,
    },
    /// System-management interrupt stuck past its timeout.
    Smi {
        line: String,
        #[serde(default = "default_err_pin_escalation")]
        escalation: EscalationConfig,
        #[serde(default)]
        policy: SmiPolicy,
        #[serde(default)]
        recovery: RecoveryAction,
    },
    /// CPU thermal trip; a companion FIVR fault line read on assert
    /// distinguishes a boot FIVR fault from a true thermal trip.
    CpuThermtrip {
        line: String,
        cpu: usize,
        #[serde(default)]
        fivr_line: Option<String>,
    },
    MemThermtrip {
        line: String,
        cpu: usize,
    },
    PchThermtrip {
        line: String,
    },
    VrHot {
        line: String,
        vr_name: String,
    },
    /// CPLD CRC error, active-high, gated on CPU presence.
    CpldCrc {
        line: String,
        cpu: usize,
        presence_line: String,
    },
    /// CPU presence, sampled at startup and on power-on.
    CpuPresence {
        line: String,
        cpu: usize,
    },
    /// CPU mismatch, sampled at startup and on power-on.
    CpuMismatch {
        line: String,
        cpu: usize,
    },
}

impl MonitorEntry {
    /// Registry key for this monitor, derived from the fault it watches.
    pub fn fault_id(&self) -> String {
        match self {
            MonitorEntry::Caterr { .. } => "caterr".to_string(),
            MonitorEntry::Mcerr { cpu, .. } => format!("cpu{cpu}_mcerr"),
            MonitorEntry::ErrPin { pin, .. } => format!("err{pin}"),
            MonitorEntry::Ierr { .. } => "ierr".to_string(),
            MonitorEntry::Smi { .. } => "smi".to_string(),
            MonitorEntry::CpuThermtrip { cpu, .. } => format!("cpu{cpu}_thermtrip"),
            MonitorEntry::MemThermtrip { cpu, .. } => format!("cpu{cpu}_mem_thermtrip"),
            MonitorEntry::PchThermtrip { .. } => "pch_thermtrip".to_string(),
            MonitorEntry::VrHot { vr_name, .. } => {
                format!("{}_vrhot", vr_name.to_lowercase())
            }
            MonitorEntry::CpldCrc { cpu, .. } => format!("cpu{cpu}_cpld_crc"),
            MonitorEntry::CpuPresence { cpu, .. } => format!("cpu{cpu}_presence"),
            MonitorEntry::CpuMismatch { cpu, .. } => format!("cpu{cpu}_mismatch"),
        }
    }

    pub fn line(&self) -> &str {
        match self {
            MonitorEntry::Caterr { line, .. }
            | MonitorEntry::Mcerr { line, .. }
            | MonitorEntry::ErrPin { line, .. }
            | MonitorEntry::Ierr { line, .. }
            | MonitorEntry::Smi { line, .. }
            | MonitorEntry::CpuThermtrip { line, .. }
            | MonitorEntry::MemThermtrip { line, .. }
            | MonitorEntry::PchThermtrip { line }
            | MonitorEntry::VrHot { line, .. }
            | MonitorEntry::CpldCrc { line, .. }
            | MonitorEntry::CpuPresence { line, .. }
            | MonitorEntry::CpuMismatch { line, .. } => line,
        }
    }
}

/// Register grid swept by the DIMM retry-read dump monitor: base coordinates
/// plus per-socket and per-channel strides over endpoint MMIO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDumpConfig {
    #[serde(default = "default_dump_interval_ms")]
    pub poll_interval_ms: u64,
    pub address_type: u8,
    pub base_target: ClientAddr,
    pub segment: u8,
    pub base_bus: u8,
    pub base_device: u8,
    pub function: u8,
    pub bar: u8,
    pub width: u8,
    pub socket_offset: u8,
    pub channel_offset: u64,
    pub num_sockets: u8,
    pub num_imcs: u8,
    pub num_channels: u8,
    /// Register name to base offset.
    pub registers: BTreeMap<String, u64>,
    /// Sensor object paths dumped alongside the registers.
    #[serde(default)]
    pub temperature_sensors: Vec<String>,
}

fn default_active_low() -> Polarity {
    Polarity::ActiveLow
}

fn default_err_pin_escalation() -> EscalationConfig {
    EscalationConfig {
        poll_interval_ms: 1_000,
        timeout_ms: 90_000,
        cadence: EscalationCadence::Once,
    }
}

fn default_ierr_escalation() -> EscalationConfig {
    EscalationConfig {
        poll_interval_ms: 100,
        timeout_ms: 2_000,
        cadence: EscalationCadence::Once,
    }
}

fn default_ierr_max_timeout_ms() -> u64 {
    600_000
}

fn default_dump_interval_ms() -> u64 {
    60_000
}

/// The standard platform monitor set, used when no config file is present.
pub fn default_monitors() -> Vec<MonitorEntry> {
    vec![
        MonitorEntry::Caterr {
            line: "CPU_CATERR".to_string(),
            cpu: None,
        },
        MonitorEntry::Mcerr {
            line: "CPU1_MCERR".to_string(),
            cpu: 1,
            polarity: Polarity::ActiveLow,
        },
        MonitorEntry::Mcerr {
            line: "CPU2_MCERR".to_string(),
            cpu: 2,
            polarity: Polarity::ActiveLow,
        },
        MonitorEntry::ErrPin {
            line: "CPU_ERR0".to_string(),
            pin: 0,
            escalation: default_err_pin_escalation(),
            beep: None,
            capture: false,
            recovery: RecoveryAction::None,
        },
        MonitorEntry::ErrPin {
            line: "CPU_ERR1".to_string(),
            pin: 1,
            escalation: default_err_pin_escalation(),
            beep: None,
            capture: false,
            recovery: RecoveryAction::None,
        },
        MonitorEntry::ErrPin {
            line: "CPU_ERR2".to_string(),
            pin: 2,
            escalation: default_err_pin_escalation(),
            beep: Some(5),
            capture: true,
            recovery: RecoveryAction::WarmReset,
        },
        MonitorEntry::Ierr {
            line: "CPU_CATERR".to_string(),
            escalation: default_ierr_escalation(),
            max_timeout_ms: default_ierr_max_timeout_ms(),
            recovery: RecoveryAction::WarmReset,
        },
        MonitorEntry::Smi {
            line: "SMI".to_string(),
            escalation: default_err_pin_escalation(),
            policy: SmiPolicy::CaptureThenRecover,
            recovery: RecoveryAction::WarmReset,
        },
        MonitorEntry::CpuThermtrip {
            line: "CPU1_THERMTRIP".to_string(),
            cpu: 1,
            fivr_line: Some("CPU1_FIVR_FAULT".to_string()),
        },
        MonitorEntry::CpuThermtrip {
            line: "CPU2_THERMTRIP".to_string(),
            cpu: 2,
            fivr_line: Some("CPU2_FIVR_FAULT".to_string()),
        },
        MonitorEntry::MemThermtrip {
            line: "CPU1_MEM_THERMTRIP".to_string(),
            cpu: 1,
        },
        MonitorEntry::MemThermtrip {
            line: "CPU2_MEM_THERMTRIP".to_string(),
            cpu: 2,
        },
        MonitorEntry::PchThermtrip {
            line: "PCH_BMC_THERMTRIP".to_string(),
        },
        MonitorEntry::VrHot {
            line: "PVCCIN_CPU1_VRHOT".to_string(),
            vr_name: "CPU1 PVCCIN".to_string(),
        },
        MonitorEntry::VrHot {
            line: "PVCCIN_CPU2_VRHOT".to_string(),
            vr_name: "CPU2 PVCCIN".to_string(),
        },
        MonitorEntry::CpldCrc {
            line: "CPLD_CRC_ERROR".to_string(),
            cpu: 2,
            presence_line: "CPU2_PRESENCE".to_string(),
        },
        MonitorEntry::CpuPresence {
            line: "CPU2_PRESENCE".to_string(),
            cpu: 2,
        },
        MonitorEntry::CpuMismatch {
            line: "CPU2_MISMATCH".to_string(),
            cpu: 2,
        },
    ]
}

impl Config {
    /// Reject configurations no monitor build could make sense of.
    pub fn validate(&self) -> Result<(), String> {
        if self.peci.min_addr > self.peci.max_addr {
            return Err(format!(
                "peci address range {:#04x}..{:#04x} is empty",
                self.peci.min_addr, self.peci.max_addr
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for entry in &self.monitors {
            let id = entry.fault_id();
            if !ids.insert(id.clone()) {
                return Err(format!("duplicate monitor {id}"));
            }
            match entry {
                MonitorEntry::ErrPin { pin, escalation, .. } => {
                    if *pin >= 32 {
                        return Err(format!("err pin {pin} out of range"));
                    }
                    validate_escalation(&id, escalation)?;
                }
                MonitorEntry::Smi { escalation, .. } => validate_escalation(&id, escalation)?,
                MonitorEntry::Ierr {
                    escalation,
                    max_timeout_ms,
                    ..
                } => {
                    validate_escalation(&id, escalation)?;
                    if escalation.timeout_ms > *max_timeout_ms {
                        return Err(format!(
                            "{id}: timeout {}ms exceeds maximum {max_timeout_ms}ms",
                            escalation.timeout_ms
                        ));
                    }
                }
                _ => {}
            }
        }

        if let Some(dump) = &self.register_dump {
            if dump.poll_interval_ms == 0 {
                return Err("register_dump poll interval must be non-zero".to_string());
            }
            if dump.registers.is_empty() {
                return Err("register_dump has no registers".to_string());
            }
        }
        Ok(())
    }
}

fn validate_escalation(id: &str, escalation: &EscalationConfig) -> Result<(), String> {
    if escalation.poll_interval_ms == 0 {
        return Err(format!("{id}: poll interval must be non-zero"));
    }
    if escalation.timeout_ms == 0 {
        return Err(format!("{id}: escalation timeout must be non-zero"));
    }
    Ok(())
}
