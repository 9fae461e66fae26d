//! Daemon configuration: monitored signal set, PECI address range, register
//! dump section.

pub mod persistence;
pub mod types;
