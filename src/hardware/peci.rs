//! PECI maintenance-channel access through the peci_cmds tool.
//! The `SocketAccess` trait isolates the transport so diagnostics can be
//! exercised against mock sockets in tests.

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// PECI client address of one processor socket (0x30 upward).
pub type ClientAddr = u8;

/// First socket address on the maintenance channel.
pub const MIN_CLIENT_ADDR: ClientAddr = 0x30;

/// Largest number of sockets the platform can carry.
pub const MAX_CPUS: usize = 8;

/// Last socket address scanned by diagnostics.
pub const MAX_CLIENT_ADDR: ClientAddr = MIN_CLIENT_ADDR + MAX_CPUS as ClientAddr - 1;

const SUCCESS_CC: u8 = 0x40;

#[derive(Debug, Error)]
pub enum PeciError {
    #[error("peci transaction timed out")]
    Timeout,
    #[error("peci completion code {cc:#04x}")]
    Protocol { cc: u8 },
    #[error("peci response malformed: {0}")]
    Malformed(String),
    #[error("peci transport: {0}")]
    Transport(String),
}

/// Processor generations with known register layouts. The diagnostic decoder
/// selects a register map by generation, so supporting a new one means adding
/// a map entry, not new decode logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuGeneration {
    SkylakeServer,
    IcelakeServer,
}

impl CpuGeneration {
    /// Match a raw CPUID with the stepping nibble masked off.
    pub fn from_cpuid(cpuid: u32) -> Option<Self> {
        match cpuid & 0xFFFF_FFF0 {
            0x0005_0650 => Some(CpuGeneration::SkylakeServer),
            0x0006_06A0 => Some(CpuGeneration::IcelakeServer),
            _ => None,
        }
    }
}

/// Identity of one populated socket.
#[derive(Debug, Clone, Copy)]
pub struct CpuIdentity {
    pub cpuid: u32,
    pub stepping: u8,
    pub generation: Option<CpuGeneration>,
}

impl CpuIdentity {
    pub fn from_cpuid(cpuid: u32) -> Self {
        Self {
            cpuid,
            stepping: (cpuid & 0xF) as u8,
            generation: CpuGeneration::from_cpuid(cpuid),
        }
    }
}

/// Addressing for one logical register. The same logical register sits at
/// different coordinates per generation; register maps carry these specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpec {
    /// Package configuration space read (index + parameter).
    PkgConfig { index: u8, parameter: u16 },
    /// PCI configuration local to the socket.
    PciLocal {
        bus: u8,
        device: u8,
        function: u8,
        offset: u16,
    },
    /// Endpoint PCI configuration (newer generations).
    EndpointPci {
        segment: u8,
        bus: u8,
        device: u8,
        function: u8,
        offset: u64,
    },
    /// Endpoint MMIO behind a BAR.
    EndpointMmio {
        segment: u8,
        bus: u8,
        device: u8,
        function: u8,
        bar: u8,
        address_type: u8,
        width: u8,
        offset: u64,
    },
    /// Model-specific register of one core.
    Msr { processor: u8, register: u16 },
}

/// Register/protocol access to the processor sockets.
#[async_trait]
pub trait SocketAccess: Send + Sync {
    /// Liveness check of one socket address.
    async fn ping(&self, addr: ClientAddr) -> Result<(), PeciError>;

    /// Identity of the socket at `addr`, or `None` when nothing is populated
    /// there.
    async fn read_identity(&self, addr: ClientAddr) -> Result<Option<CpuIdentity>, PeciError>;

    /// Read one register using the given addressing.
    async fn read_register(&self, addr: ClientAddr, spec: RegisterSpec) -> Result<u64, PeciError>;

    /// Write one register. Only MMIO targets accept writes.
    async fn write_register(
        &self,
        addr: ClientAddr,
        spec: RegisterSpec,
        value: u64,
    ) -> Result<(), PeciError>;
}

// ---------------------------------------------------------------------------
// peci_cmds backend
// ---------------------------------------------------------------------------

/// Socket access backed by the platform peci_cmds tool.
/// HOSTFAULTD_PECI_CMDS overrides the binary for emulator testing.
pub struct PeciCmdsAccess {
    tool: String,
}

impl Default for PeciCmdsAccess {
    fn default() -> Self {
        Self {
            tool: std::env::var("HOSTFAULTD_PECI_CMDS").unwrap_or_else(|_| "peci_cmds".to_string()),
        }
    }
}

impl PeciCmdsAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(&self, addr: ClientAddr) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.tool);
        cmd.args(["-a", &format!("{addr:#04x}")]);
        cmd
    }

    async fn run(&self, mut cmd: std::process::Command) -> Result<Response, PeciError> {
        trace!(
            "Executing: {} {:?}",
            self.tool,
            cmd.get_args().collect::<Vec<_>>()
        );

        let output = tokio::process::Command::from(cmd)
            .output()
            .await
            .map_err(|e| PeciError::Transport(format!("failed to execute {}: {e}", self.tool)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let response = parse_response(&stdout);

        if !output.status.success() {
            return Err(classify_failure(&response, &stdout, &stderr));
        }
        match response.cc {
            Some(SUCCESS_CC) => Ok(response),
            Some(cc) => Err(PeciError::Protocol { cc }),
            None => Err(classify_failure(&response, &stdout, &stderr)),
        }
    }

    async fn run_read(&self, cmd: std::process::Command) -> Result<u64, PeciError> {
        let response = self.run(cmd).await?;
        response
            .words
            .last()
            .copied()
            .ok_or_else(|| PeciError::Malformed("no data words in response".to_string()))
    }
}

#[async_trait]
impl SocketAccess for PeciCmdsAccess {
    async fn ping(&self, addr: ClientAddr) -> Result<(), PeciError> {
        let mut cmd = self.build_command(addr);
        cmd.arg("Ping");
        // Ping reports no completion code, only pass/fail.
        let output = tokio::process::Command::from(cmd)
            .output()
            .await
            .map_err(|e| PeciError::Transport(format!("failed to execute {}: {e}", self.tool)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PeciError::Timeout)
        }
    }

    async fn read_identity(&self, addr: ClientAddr) -> Result<Option<CpuIdentity>, PeciError> {
        let mut cmd = self.build_command(addr);
        cmd.arg("GetCPUID");
        match self.run(cmd).await {
            Ok(response) => {
                // The CPUID is the one word wide enough to carry family/model
                // bits; smaller words echo the stepping.
                let cpuid = response
                    .words
                    .iter()
                    .find(|w| **w > 0xFFFF)
                    .copied()
                    .ok_or_else(|| PeciError::Malformed("no cpuid in response".to_string()))?;
                Ok(Some(CpuIdentity::from_cpuid(cpuid as u32)))
            }
            // An address that never answers is an unpopulated socket, not a
            // fault.
            Err(PeciError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_register(&self, addr: ClientAddr, spec: RegisterSpec) -> Result<u64, PeciError> {
        let mut cmd = self.build_command(addr);
        match spec {
            RegisterSpec::PkgConfig { index, parameter } => {
                cmd.args(["RdPkgConfig", &index.to_string(), &parameter.to_string()]);
            }
            RegisterSpec::PciLocal {
                bus,
                device,
                function,
                offset,
            } => {
                cmd.args([
                    "RdPCIConfigLocal",
                    &bus.to_string(),
                    &device.to_string(),
                    &function.to_string(),
                    &format!("{offset:#x}"),
                ]);
            }
            RegisterSpec::EndpointPci {
                segment,
                bus,
                device,
                function,
                offset,
            } => {
                cmd.args([
                    "RdEndpointConfigPciLocal",
                    &segment.to_string(),
                    &bus.to_string(),
                    &device.to_string(),
                    &function.to_string(),
                    &format!("{offset:#x}"),
                ]);
            }
            RegisterSpec::EndpointMmio {
                segment,
                bus,
                device,
                function,
                bar,
                address_type,
                width,
                offset,
            } => {
                cmd.args(["-s", &width.to_string()]);
                cmd.args([
                    "RdEndpointConfigMmio",
                    &segment.to_string(),
                    &bus.to_string(),
                    &device.to_string(),
                    &function.to_string(),
                    &bar.to_string(),
                    &address_type.to_string(),
                    &format!("{offset:#x}"),
                ]);
            }
            RegisterSpec::Msr {
                processor,
                register,
            } => {
                cmd.args([
                    "RdIAMSR",
                    &processor.to_string(),
                    &format!("{register:#x}"),
                ]);
            }
        }
        self.run_read(cmd).await
    }

    async fn write_register(
        &self,
        addr: ClientAddr,
        spec: RegisterSpec,
        value: u64,
    ) -> Result<(), PeciError> {
        let RegisterSpec::EndpointMmio {
            segment,
            bus,
            device,
            function,
            bar,
            address_type,
            width,
            offset,
        } = spec
        else {
            return Err(PeciError::Transport(
                "write supported only for endpoint MMIO registers".to_string(),
            ));
        };

        let mut cmd = self.build_command(addr);
        cmd.args(["-s", &width.to_string()]);
        cmd.args([
            "WrEndpointConfigMmio",
            &segment.to_string(),
            &bus.to_string(),
            &device.to_string(),
            &function.to_string(),
            &bar.to_string(),
            &address_type.to_string(),
            &format!("{offset:#x}"),
            &format!("{value:#x}"),
        ]);
        self.run(cmd).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Response {
    cc: Option<u8>,
    words: Vec<u64>,
}

/// Pull the completion code and data words out of a peci_cmds response.
/// Tolerant of surrounding labels: the cc token reads `cc:0xNN` and data
/// words are plain `0x...` tokens.
fn parse_response(stdout: &str) -> Response {
    let mut response = Response::default();
    for token in stdout.split_whitespace() {
        if let Some(cc_hex) = token.strip_prefix("cc:0x") {
            if let Ok(cc) = u8::from_str_radix(cc_hex.trim_end_matches(','), 16) {
                response.cc = Some(cc);
            }
        } else if let Some(hex) = token.strip_prefix("0x") {
            if let Ok(word) = u64::from_str_radix(hex.trim_end_matches(','), 16) {
                response.words.push(word);
            }
        }
    }
    response
}

fn classify_failure(response: &Response, stdout: &str, stderr: &str) -> PeciError {
    if let Some(cc) = response.cc {
        if cc != SUCCESS_CC {
            return PeciError::Protocol { cc };
        }
    }
    let combined = format!("{stdout} {stderr}").to_lowercase();
    if combined.contains("timeout") || combined.contains("timed out") {
        return PeciError::Timeout;
    }
    PeciError::Malformed(stderr.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_generation_from_cpuid_masks_stepping() {
        assert_eq!(
            CpuGeneration::from_cpuid(0x0005_0654),
            Some(CpuGeneration::SkylakeServer)
        );
        assert_eq!(
            CpuGeneration::from_cpuid(0x0006_06A6),
            Some(CpuGeneration::IcelakeServer)
        );
        assert_eq!(CpuGeneration::from_cpuid(0x000A_06F0), None);
    }

    #[test]
    fn test_parse_response_extracts_cc_and_words() {
        let response = parse_response("   cc:0x40 0x000606a0\n");
        assert_eq!(response.cc, Some(0x40));
        assert_eq!(response.words, vec![0x0006_06A0]);

        let response = parse_response("RdPkgConfig cc:0x40 0x08100000");
        assert_eq!(response.cc, Some(0x40));
        assert_eq!(response.words.last(), Some(&0x0810_0000));
    }

    #[test]
    fn test_parse_response_without_cc() {
        let response = parse_response("Ping Succeeded");
        assert_eq!(response.cc, None);
        assert!(response.words.is_empty());
    }

    #[test]
    fn test_classify_failure_prefers_completion_code() {
        let response = parse_response("cc:0x90");
        assert_matches!(
            classify_failure(&response, "cc:0x90", ""),
            PeciError::Protocol { cc: 0x90 }
        );
    }

    #[test]
    fn test_classify_failure_detects_timeout() {
        let response = parse_response("");
        assert_matches!(
            classify_failure(&response, "", "Error: request timed out"),
            PeciError::Timeout
        );
    }

    #[test]
    fn test_identity_carries_stepping_nibble() {
        let identity = CpuIdentity::from_cpuid(0x0005_0654);
        assert_eq!(identity.stepping, 4);
        assert_eq!(identity.generation, Some(CpuGeneration::SkylakeServer));
    }
}
