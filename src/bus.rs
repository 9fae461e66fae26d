//! Service-layer access: traits for the external D-Bus services the daemon
//! consumes, a busctl-backed implementation, and the signal watcher feeding
//! host power state and crashdump completions into the monitors.

pub mod proxy;
pub mod watch;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Bus name this daemon claims. A second owner at startup is fatal.
pub const SERVICE_NAME: &str = "xyz.openbmc_project.HostErrorMonitor";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus call failed: {0}")]
    Call(String),
    #[error("bus reply malformed: {0}")]
    Reply(String),
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Host power state as seen by the monitors. The generation counter bumps on
/// every power-on notification so a re-arm can tell a fresh power-on from the
/// state it already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPowerState {
    pub on: bool,
    pub generation: u64,
}

impl HostPowerState {
    pub fn off() -> Self {
        Self {
            on: false,
            generation: 0,
        }
    }
}

/// Host power-state reads and power-transition requests.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn host_is_on(&self) -> Result<bool, BusError>;
    async fn request_warm_reset(&self) -> Result<(), BusError>;
    async fn request_power_cycle(&self) -> Result<(), BusError>;
}

/// Diagnostic-capture service. Completion arrives separately as a bus signal.
#[async_trait]
pub trait CrashdumpControl: Send + Sync {
    async fn generate_stored_log(&self, trigger: &str) -> Result<(), BusError>;
}

/// Audible alert by beep priority. Best-effort.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn beep(&self, priority: u8) -> Result<(), BusError>;
}

/// Per-socket persistent error counters (ErrorCountCPU<n> properties).
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn error_count(&self, cpu: usize) -> Result<u8, BusError>;
    async fn set_error_count(&self, cpu: usize, value: u8) -> Result<(), BusError>;
}

/// Fault-log dump creation from a key/value map of readings.
#[async_trait]
pub trait DumpSink: Send + Sync {
    async fn create_dump(&self, entries: &BTreeMap<String, String>) -> Result<(), BusError>;
}

/// Temperature sensor property reads.
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    async fn read_value(&self, sensor_path: &str) -> Result<f64, BusError>;
}
