//! Bus signal watcher: one long-lived `busctl monitor` child whose output is
//! routed to a host-power watch channel and a crashdump-completion broadcast
//! channel.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, HostPowerState, PowerControl};

const HOST_STATE_INTERFACE: &str = "xyz.openbmc_project.State.Host";
const HOST_STATE_OFF: &str = "xyz.openbmc_project.State.Host.HostState.Off";
const CRASHDUMP_STORED_INTERFACE: &str = "com.intel.crashdump.Stored";

/// A routed bus signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    HostState { on: bool },
    CrashdumpComplete,
}

/// Owns the monitor child and the channels fed from its output.
pub struct SignalWatcher {
    host_power: watch::Receiver<HostPowerState>,
    crashdump: broadcast::Sender<()>,
}

impl SignalWatcher {
    /// Spawn the monitor child and seed the power channel with the current
    /// host state.
    pub async fn spawn(
        tool: &str,
        power: &dyn PowerControl,
        shutdown: CancellationToken,
    ) -> Result<Self, BusError> {
        let initially_on = power.host_is_on().await?;
        let (power_tx, power_rx) = watch::channel(HostPowerState {
            on: initially_on,
            generation: 0,
        });
        let (crashdump_tx, _) = broadcast::channel(8);
        info!(
            "Host is currently {}",
            if initially_on { "on" } else { "off" }
        );

        let mut child = tokio::process::Command::new(tool)
            .args([
                "monitor",
                "--json=short",
                "--match",
                &format!(
                    "type='signal',interface='org.freedesktop.DBus.Properties',\
                     member='PropertiesChanged',arg0='{HOST_STATE_INTERFACE}'"
                ),
                "--match",
                &format!(
                    "type='signal',interface='{CRASHDUMP_STORED_INTERFACE}',\
                     member='CrashdumpComplete'"
                ),
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BusError::Spawn {
                tool: tool.to_string(),
                source: e,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusError::Call("monitor child has no stdout".to_string()))?;

        let crashdump = crashdump_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => route_line(&line, &power_tx, &crashdump_tx),
                    Ok(None) => {
                        error!("Bus monitor stream closed");
                        break;
                    }
                    Err(e) => {
                        error!("Bus monitor read failed: {e}");
                        break;
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!("Bus monitor child already gone: {e}");
            }
        });

        Ok(Self {
            host_power: power_rx,
            crashdump,
        })
    }

    /// Host power channel handed to the registry. Each power-on notification
    /// carries a fresh generation.
    pub fn host_power(&self) -> watch::Receiver<HostPowerState> {
        self.host_power.clone()
    }

    /// Subscribe to crashdump completion signals.
    pub fn crashdump_completions(&self) -> broadcast::Sender<()> {
        self.crashdump.clone()
    }
}

fn route_line(
    line: &str,
    power_tx: &watch::Sender<HostPowerState>,
    crashdump_tx: &broadcast::Sender<()>,
) {
    match parse_monitor_line(line) {
        Some(BusEvent::HostState { on }) => {
            power_tx.send_modify(|state| {
                if on {
                    // Every power-on notification re-arms the monitors, even
                    // a repeated one while already on.
                    state.generation += 1;
                }
                state.on = on;
            });
            info!("Host power state changed: {}", if on { "on" } else { "off" });
        }
        Some(BusEvent::CrashdumpComplete) => {
            info!("Crashdump completed");
            // No receiver means no capture in flight.
            let _ = crashdump_tx.send(());
        }
        None => {}
    }
}

/// Parse one line of `busctl monitor --json=short` output into a routed
/// event. Lines for other members, non-JSON chatter and PropertiesChanged
/// payloads without CurrentHostState are ignored.
pub(crate) fn parse_monitor_line(line: &str) -> Option<BusEvent> {
    let message: Value = serde_json::from_str(line.trim()).ok()?;
    match message.get("member")?.as_str()? {
        "CrashdumpComplete" => Some(BusEvent::CrashdumpComplete),
        "PropertiesChanged" => {
            let payload = message.get("payload")?.get("data")?.as_array()?;
            if payload.first()?.as_str()? != HOST_STATE_INTERFACE {
                return None;
            }
            let state = payload
                .get(1)?
                .get("CurrentHostState")?
                .get("data")?
                .as_str()?;
            Some(BusEvent::HostState {
                on: state != HOST_STATE_OFF,
            })
        }
        other => {
            warn!("Unexpected bus signal member {other}");
            None
        }
    }
}
