//! Diagnostic decoder: attributes a shared fault line to the socket(s) that
//! drove it and sub-classifies the root cause.
//!
//! A multi-drop line like an error pin carries no socket identity. The
//! decoder walks every socket address, reads that generation's error-source
//! status register, and marks the sockets whose silicon confirms the fault.
//! IERR attribution additionally runs a fixed-priority chain of register
//! checks to name the root cause, stopping at the first match.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::bus::CounterStore;
use crate::hardware::peci::{ClientAddr, SocketAccess, MAX_CPUS};
use crate::hardware::registers::{
    register_map, RegisterMap, IERR_INTERNAL, MC4_STATUS, MSEC_FIVR_CATASTROPHIC_CODES,
    MSEC_VR_MISMATCH_CODES, MSMI_INTERNAL,
};

/// Which shared fault line is being attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSource {
    /// Error pin ERRn; status is the error-pin-status register, bit `n`.
    ErrPin(u8),
    /// IERR/CATERR; status is the MCA error source log.
    Ierr,
}

impl fmt::Display for FaultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSource::ErrPin(pin) => write!(f, "ERR{pin}"),
            FaultSource::Ierr => write!(f, "IERR"),
        }
    }
}

/// Root-cause classification of an IERR, in decode priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    CpuVrMismatch,
    CoreFivrFault,
    UncoreFivrFault,
    Unclassified,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::CpuVrMismatch => write!(f, "CPU/VR Mismatch"),
            Classification::CoreFivrFault => write!(f, "Core FIVR Fault"),
            Classification::UncoreFivrFault => write!(f, "Uncore FIVR Fault"),
            Classification::Unclassified => write!(f, "Unclassified"),
        }
    }
}

/// Attribution result for one fault occurrence. Ephemeral; consumed by
/// logging and dropped.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub source: FaultSource,
    /// Bitmask over socket indices 0..MAX_CPUS.
    pub cpu_mask: u32,
    pub classifications: Vec<CpuFault>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFault {
    pub cpu: usize,
    pub classification: Classification,
}

impl FaultRecord {
    fn new(source: FaultSource) -> Self {
        Self {
            source,
            cpu_mask: 0,
            classifications: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// True when no socket's registers confirmed the shared line assertion;
    /// the caller logs a generic "one of the sockets" record.
    pub fn is_empty(&self) -> bool {
        self.cpu_mask == 0
    }

    pub fn implicates(&self, cpu: usize) -> bool {
        self.cpu_mask & (1 << cpu) != 0
    }
}

pub struct DiagnosticDecoder {
    access: Arc<dyn SocketAccess>,
    counters: Arc<dyn CounterStore>,
    min_addr: ClientAddr,
    max_addr: ClientAddr,
}

impl DiagnosticDecoder {
    pub fn new(
        access: Arc<dyn SocketAccess>,
        counters: Arc<dyn CounterStore>,
        min_addr: ClientAddr,
        max_addr: ClientAddr,
    ) -> Self {
        Self {
            access,
            counters,
            min_addr,
            max_addr,
        }
    }

    /// Walk every socket address and attribute `source` to the sockets whose
    /// status register confirms it. Register failures leave a socket or check
    /// inconclusive, never abort the walk.
    pub async fn attribute(&self, source: FaultSource) -> FaultRecord {
        let mut record = FaultRecord::new(source);

        for (cpu, addr) in (self.min_addr..=self.max_addr).enumerate().take(MAX_CPUS) {
            let identity = match self.access.read_identity(addr).await {
                Ok(Some(identity)) => identity,
                // Nothing populated at this address.
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cannot get CPUID of socket {cpu}: {e}");
                    continue;
                }
            };
            let Some(generation) = identity.generation else {
                warn!(
                    "Socket {cpu} reports unknown CPUID {:#010x}, skipping",
                    identity.cpuid
                );
                continue;
            };
            let map = register_map(generation);

            let (status_spec, status_mask, status_name) = match source {
                FaultSource::ErrPin(pin) => {
                    (map.err_pin_status, 1u64 << pin, "ERRPINSTS")
                }
                FaultSource::Ierr => (
                    map.mca_err_src_log,
                    MSMI_INTERNAL | IERR_INTERNAL,
                    "MCA_ERR_SRC_LOG",
                ),
            };
            let status = match self.access.read_register(addr, status_spec).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to read {status_name} on socket {cpu}: {e}");
                    continue;
                }
            };
            if status & status_mask == 0 {
                debug!("Socket {cpu} did not cause {source}");
                continue;
            }

            record.cpu_mask |= 1 << cpu;
            self.increment_error_count(cpu).await;

            let classification = match source {
                FaultSource::Ierr => self.classify(cpu, addr, map).await,
                FaultSource::ErrPin(_) => Classification::Unclassified,
            };
            record.classifications.push(CpuFault {
                cpu,
                classification,
            });
        }

        debug!(
            "{} attribution at {}: cpu mask {:#x}",
            record.source,
            record.timestamp.to_rfc3339(),
            record.cpu_mask
        );
        record
    }

    /// Sub-classify an IERR root cause in fixed priority order, stopping at
    /// the first match. A register failure marks that check "did not match"
    /// and falls through.
    async fn classify(
        &self,
        cpu: usize,
        addr: ClientAddr,
        map: &RegisterMap,
    ) -> Classification {
        // MSEC byte (bits 31:24) of the machine-check status.
        let msec = match self.access.read_register(addr, MC4_STATUS).await {
            Ok(value) => Some((value >> 24) & 0xFF),
            Err(e) => {
                warn!("Failed to read IA32_MC4_STATUS on socket {cpu}: {e}");
                None
            }
        };
        if msec.is_some_and(|code| MSEC_VR_MISMATCH_CODES.contains(&code)) {
            return Classification::CpuVrMismatch;
        }

        let mut core_fivr_clear = true;
        let mut core_fivr_fault = false;
        for spec in map.core_fivr_err_log {
            match self.access.read_register(addr, *spec).await {
                Ok(value) => core_fivr_fault |= value != 0,
                Err(e) => {
                    warn!("Failed to read CORE_FIVR_ERR_LOG on socket {cpu}: {e}");
                    core_fivr_clear = false;
                }
            }
        }
        if core_fivr_fault {
            return Classification::CoreFivrFault;
        }

        let uncore_fivr = match self.access.read_register(addr, map.uncore_fivr_err_log).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to read UNCORE_FIVR_ERR_LOG on socket {cpu}: {e}");
                None
            }
        };
        if uncore_fivr.is_some_and(|value| value != 0) {
            return Classification::UncoreFivrFault;
        }

        // With both FIVR logs confirmed clear, a catastrophic
        // overvoltage/overcurrent code still reports as an uncore fault.
        if core_fivr_clear
            && uncore_fivr == Some(0)
            && msec.is_some_and(|code| MSEC_FIVR_CATASTROPHIC_CODES.contains(&code))
        {
            return Classification::UncoreFivrFault;
        }

        Classification::Unclassified
    }

    /// Best-effort read-increment-write of the socket's persistent error
    /// counter. Saturates at the maximum; failures never block reporting.
    async fn increment_error_count(&self, cpu: usize) {
        let count = match self.counters.error_count(cpu).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to read error count of CPU {}: {e}", cpu + 1);
                return;
            }
        };
        if count == u8::MAX {
            warn!("Maximum error count reached for CPU {}", cpu + 1);
            return;
        }
        if let Err(e) = self.counters.set_error_count(cpu, count + 1).await {
            warn!("Failed to set error count of CPU {}: {e}", cpu + 1);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MockAccess, MockCounters, MockSocket};
    use super::*;
    use crate::hardware::peci::MIN_CLIENT_ADDR;
    use crate::hardware::registers::register_map;
    use crate::hardware::peci::CpuGeneration;
    use assert_matches::assert_matches;

    const SKX_CPUID: u32 = 0x0005_0654;
    const ICX_CPUID: u32 = 0x0006_06A6;

    fn skx_map() -> &'static RegisterMap {
        register_map(CpuGeneration::SkylakeServer)
    }

    fn decoder(access: MockAccess, counters: MockCounters) -> DiagnosticDecoder {
        DiagnosticDecoder::new(
            Arc::new(access),
            Arc::new(counters),
            MIN_CLIENT_ADDR,
            MIN_CLIENT_ADDR + 7,
        )
    }

    /// An SKX socket whose MCA error source log reports an internal IERR.
    fn ierr_socket() -> MockSocket {
        MockSocket::new(SKX_CPUID)
            .with_register(skx_map().mca_err_src_log, IERR_INTERNAL)
    }

    #[tokio::test]
    async fn test_attributes_err_pin_to_reporting_socket_only() {
        let map = skx_map();
        let access = MockAccess::default()
            .with_socket(
                MIN_CLIENT_ADDR,
                MockSocket::new(SKX_CPUID).with_register(map.err_pin_status, 0),
            )
            .with_socket(
                MIN_CLIENT_ADDR + 1,
                MockSocket::new(SKX_CPUID).with_register(map.err_pin_status, 1 << 2),
            )
            .with_socket(
                MIN_CLIENT_ADDR + 2,
                MockSocket::new(SKX_CPUID).with_register(map.err_pin_status, 0),
            );
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::ErrPin(2)).await;

        assert_eq!(record.cpu_mask, 0b010);
        assert!(record.implicates(1));
        assert!(!record.implicates(0) && !record.implicates(2));
    }

    #[tokio::test]
    async fn test_counter_increments_exactly_once_per_implicated_socket() {
        let map = skx_map();
        let access = MockAccess::default()
            .with_socket(
                MIN_CLIENT_ADDR,
                MockSocket::new(SKX_CPUID).with_register(map.err_pin_status, 0),
            )
            .with_socket(
                MIN_CLIENT_ADDR + 1,
                MockSocket::new(SKX_CPUID).with_register(map.err_pin_status, 1 << 0),
            );
        let counters = MockCounters::default().with_count(1, 4);
        let decoder = DiagnosticDecoder::new(
            Arc::new(access),
            Arc::new(counters),
            MIN_CLIENT_ADDR,
            MIN_CLIENT_ADDR + 7,
        );

        let record = decoder.attribute(FaultSource::ErrPin(0)).await;
        assert!(record.implicates(1));

        assert_eq!(decoder.counters.error_count(1).await.unwrap(), 5);
        assert_eq!(decoder.counters.error_count(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_saturates_at_maximum() {
        let counters = MockCounters::default().with_count(0, u8::MAX);
        let access = MockAccess::default().with_socket(
            MIN_CLIENT_ADDR,
            ierr_socket(),
        );
        let decoder = DiagnosticDecoder::new(
            Arc::new(access),
            Arc::new(counters),
            MIN_CLIENT_ADDR,
            MIN_CLIENT_ADDR,
        );

        decoder.attribute(FaultSource::Ierr).await;
        assert_eq!(decoder.counters.error_count(0).await.unwrap(), u8::MAX);
    }

    #[tokio::test]
    async fn test_mismatch_takes_priority_over_core_fivr() {
        let map = skx_map();
        let socket = ierr_socket()
            .with_register(MC4_STATUS, 0x42 << 24)
            .with_register(map.core_fivr_err_log[0], 0xDEAD)
            .with_register(map.uncore_fivr_err_log, 0);
        let access = MockAccess::default().with_socket(MIN_CLIENT_ADDR, socket);
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;

        // Priority short-circuit: mismatch only, never double-reported.
        assert_eq!(record.classifications.len(), 1);
        assert_matches!(
            record.classifications[0],
            CpuFault {
                cpu: 0,
                classification: Classification::CpuVrMismatch
            }
        );
    }

    #[tokio::test]
    async fn test_core_fivr_before_uncore() {
        let map = skx_map();
        let socket = ierr_socket()
            .with_register(MC4_STATUS, 0)
            .with_register(map.core_fivr_err_log[0], 1)
            .with_register(map.uncore_fivr_err_log, 1);
        let access = MockAccess::default().with_socket(MIN_CLIENT_ADDR, socket);
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;
        assert_eq!(
            record.classifications[0].classification,
            Classification::CoreFivrFault
        );
    }

    #[tokio::test]
    async fn test_catastrophic_code_reports_uncore_when_logs_clear() {
        let map = skx_map();
        let socket = ierr_socket()
            .with_register(MC4_STATUS, 0x51 << 24)
            .with_register(map.core_fivr_err_log[0], 0)
            .with_register(map.uncore_fivr_err_log, 0);
        let access = MockAccess::default().with_socket(MIN_CLIENT_ADDR, socket);
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;
        assert_eq!(
            record.classifications[0].classification,
            Classification::UncoreFivrFault
        );
    }

    #[tokio::test]
    async fn test_failed_check_falls_through_to_next_priority() {
        // MC4 and core FIVR reads fail (absent registers), uncore reports.
        let map = skx_map();
        let socket = ierr_socket().with_register(map.uncore_fivr_err_log, 7);
        let access = MockAccess::default().with_socket(MIN_CLIENT_ADDR, socket);
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;
        assert_eq!(
            record.classifications[0].classification,
            Classification::UncoreFivrFault
        );
    }

    #[tokio::test]
    async fn test_all_checks_failed_is_unclassified() {
        let access = MockAccess::default().with_socket(MIN_CLIENT_ADDR, ierr_socket());
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;
        assert_eq!(
            record.classifications[0].classification,
            Classification::Unclassified
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_assertion_yields_empty_record() {
        // The shared line asserted but no socket's register confirms it.
        let map = skx_map();
        let access = MockAccess::default().with_socket(
            MIN_CLIENT_ADDR,
            MockSocket::new(SKX_CPUID).with_register(map.mca_err_src_log, 0),
        );
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::Ierr).await;
        assert!(record.is_empty());
        assert!(record.classifications.is_empty());
    }

    #[tokio::test]
    async fn test_status_read_failure_skips_socket_not_walk() {
        let icx = register_map(CpuGeneration::IcelakeServer);
        let access = MockAccess::default()
            // Socket 0 has no readable status register at all.
            .with_socket(MIN_CLIENT_ADDR, MockSocket::new(SKX_CPUID))
            .with_socket(
                MIN_CLIENT_ADDR + 1,
                MockSocket::new(ICX_CPUID).with_register(icx.err_pin_status, 1 << 1),
            );
        let decoder = decoder(access, MockCounters::default());

        let record = decoder.attribute(FaultSource::ErrPin(1)).await;
        assert_eq!(record.cpu_mask, 0b10);
    }
}
