//! Per-generation register coordinates used by the diagnostic decoder.
//!
//! The same logical register sits at different bus/device/offset coordinates
//! on each processor generation. Supporting a new generation means adding a
//! map here, not touching the decode logic.

use crate::hardware::peci::{CpuGeneration, RegisterSpec};

/// Error-source status bits in MCA_ERR_SRC_LOG.
pub const MSMI_INTERNAL: u64 = 1 << 20;
pub const IERR_INTERNAL: u64 = 1 << 27;

/// MSEC byte codes (IA32_MC4_STATUS bits 31:24) reporting a CPU/VR mismatch:
/// VCCIN ICC max failure, VCCIN VOUT failure, VR capability error.
pub const MSEC_VR_MISMATCH_CODES: [u64; 3] = [0x40, 0x42, 0x43];

/// MSEC byte codes for catastrophic FIVR overvoltage/overcurrent, reported as
/// an uncore FIVR fault when both FIVR error logs read zero.
pub const MSEC_FIVR_CATASTROPHIC_CODES: [u64; 2] = [0x51, 0x52];

/// IA32_MC4_STATUS machine-check MSR, common to both generations.
pub const MC4_STATUS: RegisterSpec = RegisterSpec::Msr {
    processor: 0,
    register: 0x411,
};

/// Coordinates of the registers one generation exposes to diagnostics.
pub struct RegisterMap {
    /// MCA error source log; MSMI_INTERNAL/IERR_INTERNAL identify the socket
    /// that raised an IERR.
    pub mca_err_src_log: RegisterSpec,
    /// Error-pin status; bit `n` identifies the socket driving ERRn.
    pub err_pin_status: RegisterSpec,
    /// Core FIVR error logs, any non-zero value reports a core FIVR fault.
    pub core_fivr_err_log: &'static [RegisterSpec],
    /// Uncore FIVR error log.
    pub uncore_fivr_err_log: RegisterSpec,
}

static SKYLAKE_SERVER: RegisterMap = RegisterMap {
    mca_err_src_log: RegisterSpec::PkgConfig {
        index: 0,
        parameter: 5,
    },
    err_pin_status: RegisterSpec::PciLocal {
        bus: 0,
        device: 8,
        function: 0,
        offset: 0x210,
    },
    core_fivr_err_log: &[RegisterSpec::PciLocal {
        bus: 1,
        device: 30,
        function: 2,
        offset: 0x80,
    }],
    uncore_fivr_err_log: RegisterSpec::PciLocal {
        bus: 1,
        device: 30,
        function: 2,
        offset: 0x84,
    },
};

// Bus 31/30 of these devices are reached on PECI as buses 14/13.
static ICELAKE_SERVER: RegisterMap = RegisterMap {
    mca_err_src_log: RegisterSpec::PkgConfig {
        index: 0,
        parameter: 5,
    },
    err_pin_status: RegisterSpec::EndpointPci {
        segment: 0,
        bus: 13,
        device: 0,
        function: 3,
        offset: 0x274,
    },
    core_fivr_err_log: &[
        RegisterSpec::EndpointPci {
            segment: 0,
            bus: 14,
            device: 30,
            function: 2,
            offset: 0xC0,
        },
        RegisterSpec::EndpointPci {
            segment: 0,
            bus: 14,
            device: 30,
            function: 2,
            offset: 0xC4,
        },
    ],
    uncore_fivr_err_log: RegisterSpec::EndpointPci {
        segment: 0,
        bus: 14,
        device: 30,
        function: 2,
        offset: 0x84,
    },
};

pub fn register_map(generation: CpuGeneration) -> &'static RegisterMap {
    match generation {
        CpuGeneration::SkylakeServer => &SKYLAKE_SERVER,
        CpuGeneration::IcelakeServer => &ICELAKE_SERVER,
    }
}
