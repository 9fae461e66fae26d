//! Fault signal lines: polarity-normalized level reads and edge waits over sysfs GPIO.

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, warn};

const GPIO_SYSFS_ROOT: &str = "/sys/class/gpio";

/// Electrical polarity of a fault signal.
///
/// Monitors always see normalized levels: `true` means the fault condition is
/// present, regardless of how the pin is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// A normalized signal transition. With polarity normalization applied,
/// `Rising` always means the fault condition appeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("signal line {0} not found")]
    NotFound(String),
    #[error("permission denied opening signal line {0}")]
    PermissionDenied(String),
    #[error("i/o error on signal line {line}: {source}")]
    Io {
        line: String,
        #[source]
        source: std::io::Error,
    },
}

impl LineError {
    fn from_io(line: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => LineError::NotFound(line.to_string()),
            std::io::ErrorKind::PermissionDenied => LineError::PermissionDenied(line.to_string()),
            _ => LineError::Io {
                line: line.to_string(),
                source: err,
            },
        }
    }
}

/// One digital fault input. Implementations normalize polarity so `true`
/// always means asserted, and `Edge::Rising` always means assertion.
#[async_trait]
pub trait SignalLine: Send {
    /// Name the line was opened with.
    fn name(&self) -> &str;

    /// Synchronous level read, polarity-normalized.
    fn is_asserted(&self) -> Result<bool, LineError>;

    /// Wait for the next edge. Suspension point; dropping the future cancels
    /// the wait without side effects.
    async fn wait_for_edge(&mut self) -> Result<Edge, LineError>;

    /// Discard any stale queued edge notifications so a following level read
    /// reflects only the current state.
    async fn flush_events(&mut self);
}

/// Production line backend over the kernel sysfs GPIO interface.
///
/// The config names a node under /sys/class/gpio (exported by platform
/// bring-up). Polarity normalization is delegated to the kernel through the
/// `active_low` attribute, and edge notification uses priority readiness on
/// the `value` attribute.
pub struct SysfsLine {
    name: String,
    value: AsyncFd<std::fs::File>,
}

impl SysfsLine {
    /// Open a line and claim it for the process lifetime.
    pub fn open(name: &str, polarity: Polarity) -> Result<Self, LineError> {
        let base = PathBuf::from(GPIO_SYSFS_ROOT).join(name);
        if !base.exists() {
            return Err(LineError::NotFound(name.to_string()));
        }

        let active_low = match polarity {
            Polarity::ActiveHigh => "0",
            Polarity::ActiveLow => "1",
        };
        std::fs::write(base.join("active_low"), active_low)
            .map_err(|e| LineError::from_io(name, e))?;
        std::fs::write(base.join("edge"), "both").map_err(|e| LineError::from_io(name, e))?;

        let file = std::fs::File::open(base.join("value"))
            .map_err(|e| LineError::from_io(name, e))?;
        let value = AsyncFd::with_interest(file, Interest::PRIORITY)
            .map_err(|e| LineError::from_io(name, e))?;

        let line = Self {
            name: name.to_string(),
            value,
        };
        // First read arms the priority notification.
        line.read_level()?;
        debug!("Opened signal line {} ({:?})", name, polarity);
        Ok(line)
    }

    fn read_level(&self) -> Result<bool, LineError> {
        let mut buf = [0u8; 8];
        let n = self
            .value
            .get_ref()
            .read_at(&mut buf, 0)
            .map_err(|e| LineError::from_io(&self.name, e))?;
        Ok(n > 0 && buf[0] == b'1')
    }
}

#[async_trait]
impl SignalLine for SysfsLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_asserted(&self) -> Result<bool, LineError> {
        self.read_level()
    }

    async fn wait_for_edge(&mut self) -> Result<Edge, LineError> {
        let mut guard = self
            .value
            .ready(Interest::PRIORITY)
            .await
            .map_err(|e| LineError::from_io(&self.name, e))?;
        guard.clear_ready();
        drop(guard);

        // sysfs reports a change, not a direction; the post-event level tells
        // us which edge this was.
        Ok(edge_from_level(self.read_level()?))
    }

    async fn flush_events(&mut self) {
        if let Ok(Ok(mut guard)) =
            tokio::time::timeout(Duration::ZERO, self.value.ready(Interest::PRIORITY)).await
        {
            guard.clear_ready();
        }
        if let Err(e) = self.read_level() {
            warn!("Failed to flush {}: {}", self.name, e);
        }
    }
}

pub(crate) fn edge_from_level(asserted: bool) -> Edge {
    if asserted {
        Edge::Rising
    } else {
        Edge::Falling
    }
}

/// Enumerate exported line nodes for the hardware probe mode.
pub fn exported_lines() -> Vec<String> {
    let pattern = format!("{GPIO_SYSFS_ROOT}/*");
    let mut lines: Vec<String> = glob::glob(&pattern)
        .map(|paths| {
            paths
                .filter_map(|p| p.ok())
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .filter(|n| is_line_node(n))
                .collect()
        })
        .unwrap_or_default();
    lines.sort();
    lines
}

fn is_line_node(name: &str) -> bool {
    !name.starts_with("gpiochip") && name != "export" && name != "unexport"
}

/// Check a line node exists without claiming it.
pub fn line_exists(name: &str) -> bool {
    Path::new(GPIO_SYSFS_ROOT).join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_io_error_classification() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_matches!(
            LineError::from_io("CPU_CATERR", not_found),
            LineError::NotFound(name) if name == "CPU_CATERR"
        );

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_matches!(
            LineError::from_io("SMI", denied),
            LineError::PermissionDenied(name) if name == "SMI"
        );

        let other = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_matches!(
            LineError::from_io("SMI", other),
            LineError::Io { line, .. } if line == "SMI"
        );
    }

    #[test]
    fn test_edge_follows_level() {
        assert_eq!(edge_from_level(true), Edge::Rising);
        assert_eq!(edge_from_level(false), Edge::Falling);
    }

    #[test]
    fn test_line_node_filter() {
        assert!(is_line_node("CPU_CATERR"));
        assert!(is_line_node("gpio42"));
        assert!(!is_line_node("gpiochip0"));
        assert!(!is_line_node("export"));
        assert!(!is_line_node("unexport"));
    }
}
