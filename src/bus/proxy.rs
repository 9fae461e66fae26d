//! busctl subprocess backend for the service-layer traits.
//! One short-lived busctl invocation per property get/set or method call,
//! replies parsed from `--json=short` output.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::bus::{
    AlertSink, BusError, CounterStore, CrashdumpControl, DumpSink, PowerControl,
    TemperatureSource, SERVICE_NAME,
};

const HOST_SERVICE: &str = "xyz.openbmc_project.State.Host";
const HOST_OBJECT: &str = "/xyz/openbmc_project/state/host0";
const HOST_STATE_OFF: &str = "xyz.openbmc_project.State.Host.HostState.Off";
const HOST_TRANSITION_WARM_REBOOT: &str =
    "xyz.openbmc_project.State.Host.Transition.ForceWarmReboot";

const CHASSIS_SERVICE: &str = "xyz.openbmc_project.State.Chassis";
const CHASSIS_OBJECT: &str = "/xyz/openbmc_project/state/chassis0";
const CHASSIS_TRANSITION_POWER_CYCLE: &str =
    "xyz.openbmc_project.State.Chassis.Transition.PowerCycle";

const CRASHDUMP_SERVICE: &str = "com.intel.crashdump";
const CRASHDUMP_OBJECT: &str = "/com/intel/crashdump";
const CRASHDUMP_INTERFACE: &str = "com.intel.crashdump.Stored";

const BEEP_SERVICE: &str = "xyz.openbmc_project.BeepCode";
const BEEP_OBJECT: &str = "/xyz/openbmc_project/BeepCode";

const ERR_CONFIG_SERVICE: &str = "xyz.openbmc_project.Settings";
const ERR_CONFIG_OBJECT: &str = "/xyz/openbmc_project/control/processor_error_config";
const ERR_CONFIG_INTERFACE: &str = "xyz.openbmc_project.Control.Processor.ErrConfig";

const DUMP_SERVICE: &str = "xyz.openbmc_project.Dump.Manager";
const DUMP_OBJECT: &str = "/xyz/openbmc_project/dump/faultlog";
const DUMP_INTERFACE: &str = "xyz.openbmc_project.Dump.Create";

const SENSOR_SERVICE: &str = "xyz.openbmc_project.HwmonTempSensor";
const SENSOR_INTERFACE: &str = "xyz.openbmc_project.Sensor.Value";

/// Service access through the busctl tool.
/// HOSTFAULTD_BUSCTL overrides the binary for emulator testing.
#[derive(Clone)]
pub struct BusctlProxy {
    tool: String,
}

impl Default for BusctlProxy {
    fn default() -> Self {
        Self {
            tool: std::env::var("HOSTFAULTD_BUSCTL").unwrap_or_else(|_| "busctl".to_string()),
        }
    }
}

impl BusctlProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    async fn run(&self, args: &[&str]) -> Result<String, BusError> {
        trace!("Executing: {} {:?}", self.tool, args);

        let output = tokio::process::Command::new(&self.tool)
            .args(args)
            .output()
            .await
            .map_err(|e| BusError::Spawn {
                tool: self.tool.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(BusError::Call(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn get_property(
        &self,
        service: &str,
        object: &str,
        interface: &str,
        member: &str,
    ) -> Result<Value, BusError> {
        let stdout = self
            .run(&[
                "get-property",
                "--json=short",
                service,
                object,
                interface,
                member,
            ])
            .await?;
        parse_property_reply(&stdout)
    }

    async fn set_property(
        &self,
        service: &str,
        object: &str,
        interface: &str,
        member: &str,
        signature: &str,
        value: &str,
    ) -> Result<(), BusError> {
        self.run(&[
            "set-property",
            service,
            object,
            interface,
            member,
            signature,
            value,
        ])
        .await
        .map(|_| ())
    }

    /// Probe the bus and reject a second daemon instance. Failure here is
    /// fatal at startup.
    pub async fn startup_probe(&self) -> Result<(), BusError> {
        self.run(&["status", "--no-pager"]).await?;

        let stdout = self
            .run(&[
                "call",
                "--json=short",
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "NameHasOwner",
                "s",
                SERVICE_NAME,
            ])
            .await?;
        if parse_name_has_owner(&stdout)? {
            return Err(BusError::Call(format!(
                "{SERVICE_NAME} is already owned, another instance is running"
            )));
        }
        Ok(())
    }
}

/// Extract the `data` field of a --json=short property reply.
fn parse_property_reply(stdout: &str) -> Result<Value, BusError> {
    let reply: Value =
        serde_json::from_str(stdout.trim()).map_err(|e| BusError::Reply(e.to_string()))?;
    reply
        .get("data")
        .cloned()
        .ok_or_else(|| BusError::Reply("no data field in reply".to_string()))
}

fn parse_name_has_owner(stdout: &str) -> Result<bool, BusError> {
    let data = parse_property_reply(stdout)?;
    // Method replies wrap the payload in a data array.
    match &data {
        Value::Bool(owned) => Ok(*owned),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| BusError::Reply("NameHasOwner reply not a bool".to_string())),
        other => Err(BusError::Reply(format!(
            "NameHasOwner reply not a bool: {other}"
        ))),
    }
}

/// Build the busctl argument tail for CreateDump: an a{sv} map with every
/// value passed as a string variant.
fn dump_call_args(entries: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec!["a{sv}".to_string(), entries.len().to_string()];
    for (key, value) in entries {
        args.push(key.clone());
        args.push("s".to_string());
        args.push(value.clone());
    }
    args
}

#[async_trait]
impl PowerControl for BusctlProxy {
    async fn host_is_on(&self) -> Result<bool, BusError> {
        let data = self
            .get_property(HOST_SERVICE, HOST_OBJECT, HOST_SERVICE, "CurrentHostState")
            .await?;
        let state = data
            .as_str()
            .ok_or_else(|| BusError::Reply("CurrentHostState not a string".to_string()))?;
        Ok(state != HOST_STATE_OFF)
    }

    async fn request_warm_reset(&self) -> Result<(), BusError> {
        debug!("Requesting host warm reset");
        self.set_property(
            HOST_SERVICE,
            HOST_OBJECT,
            HOST_SERVICE,
            "RequestedHostTransition",
            "s",
            HOST_TRANSITION_WARM_REBOOT,
        )
        .await
    }

    async fn request_power_cycle(&self) -> Result<(), BusError> {
        debug!("Requesting chassis power cycle");
        self.set_property(
            CHASSIS_SERVICE,
            CHASSIS_OBJECT,
            CHASSIS_SERVICE,
            "RequestedPowerTransition",
            "s",
            CHASSIS_TRANSITION_POWER_CYCLE,
        )
        .await
    }
}

#[async_trait]
impl CrashdumpControl for BusctlProxy {
    async fn generate_stored_log(&self, trigger: &str) -> Result<(), BusError> {
        self.run(&[
            "call",
            CRASHDUMP_SERVICE,
            CRASHDUMP_OBJECT,
            CRASHDUMP_INTERFACE,
            "GenerateStoredLog",
            "s",
            trigger,
        ])
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl AlertSink for BusctlProxy {
    async fn beep(&self, priority: u8) -> Result<(), BusError> {
        self.run(&[
            "call",
            BEEP_SERVICE,
            BEEP_OBJECT,
            BEEP_SERVICE,
            "Beep",
            "y",
            &priority.to_string(),
        ])
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CounterStore for BusctlProxy {
    async fn error_count(&self, cpu: usize) -> Result<u8, BusError> {
        let member = format!("ErrorCountCPU{}", cpu + 1);
        let data = self
            .get_property(
                ERR_CONFIG_SERVICE,
                ERR_CONFIG_OBJECT,
                ERR_CONFIG_INTERFACE,
                &member,
            )
            .await?;
        data.as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| BusError::Reply(format!("{member} not a byte")))
    }

    async fn set_error_count(&self, cpu: usize, value: u8) -> Result<(), BusError> {
        let member = format!("ErrorCountCPU{}", cpu + 1);
        self.set_property(
            ERR_CONFIG_SERVICE,
            ERR_CONFIG_OBJECT,
            ERR_CONFIG_INTERFACE,
            &member,
            "y",
            &value.to_string(),
        )
        .await
    }
}

#[async_trait]
impl DumpSink for BusctlProxy {
    async fn create_dump(&self, entries: &BTreeMap<String, String>) -> Result<(), BusError> {
        let mut args = vec![
            "call".to_string(),
            DUMP_SERVICE.to_string(),
            DUMP_OBJECT.to_string(),
            DUMP_INTERFACE.to_string(),
            "CreateDump".to_string(),
        ];
        args.extend(dump_call_args(entries));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await.map(|_| ())
    }
}

#[async_trait]
impl TemperatureSource for BusctlProxy {
    async fn read_value(&self, sensor_path: &str) -> Result<f64, BusError> {
        let data = self
            .get_property(SENSOR_SERVICE, sensor_path, SENSOR_INTERFACE, "Value")
            .await?;
        data.as_f64()
            .ok_or_else(|| BusError::Reply(format!("{sensor_path} value not a double")))
    }
}
