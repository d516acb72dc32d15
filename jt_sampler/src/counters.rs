use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the interface counter source.
#[derive(Error, Debug)]
pub enum CounterError {
    /// The interface does not exist (or vanished).
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    /// A statistics file could not be read.
    #[error("failed to read counters for {iface}: {source}")]
    ReadFailed {
        /// Interface being read.
        iface: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// One reading of an interface's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Received bytes.
    pub rx_bytes: u64,
    /// Transmitted bytes.
    pub tx_bytes: u64,
    /// Received packets.
    pub rx_packets: u64,
    /// Transmitted packets.
    pub tx_packets: u64,
}

/// Boundary to the kernel counter source. The sampling thread only ever
/// sees this trait; tests substitute a scripted implementation.
pub trait CounterSource: Send + Sync {
    /// Reads the current cumulative counters for `iface`.
    fn read_counters(&self, iface: &str) -> Result<InterfaceCounters, CounterError>;
}

/// Production counter source reading `/sys/class/net/<iface>/statistics`.
pub struct SysClassNet {
    root: PathBuf,
}

impl Default for SysClassNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SysClassNet {
    /// Source rooted at the real sysfs mount.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
        }
    }

    /// Source rooted elsewhere, for tests against a fake sysfs tree.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_stat(&self, iface: &str, stat: &str) -> Result<u64, CounterError> {
        let path = self.root.join(iface).join("statistics").join(stat);
        let text = read_to_string(&path).map_err(|source| CounterError::ReadFailed {
            iface: iface.to_string(),
            source,
        })?;
        Ok(text.trim().parse().unwrap_or(0))
    }

    /// A statistic that may legitimately be absent (e.g. the compressed
    /// counters on most drivers).
    fn read_stat_or_zero(&self, iface: &str, stat: &str) -> u64 {
        self.read_stat(iface, stat).unwrap_or(0)
    }
}

impl CounterSource for SysClassNet {
    fn read_counters(&self, iface: &str) -> Result<InterfaceCounters, CounterError> {
        if !self.root.join(iface).exists() {
            return Err(CounterError::UnknownInterface(iface.to_string()));
        }
        // Packet totals include the compressed counters, matching what
        // the kernel reports for RTNL_LINK_{RX,TX}_PACKETS + COMPRESSED.
        Ok(InterfaceCounters {
            rx_bytes: self.read_stat(iface, "rx_bytes")?,
            tx_bytes: self.read_stat(iface, "tx_bytes")?,
            rx_packets: self.read_stat(iface, "rx_packets")?
                + self.read_stat_or_zero(iface, "rx_compressed"),
            tx_packets: self.read_stat(iface, "tx_packets")?
                + self.read_stat_or_zero(iface, "tx_compressed"),
        })
    }
}

/// Enumerates the interfaces visible under `/sys/class/net`.
pub fn list_interfaces() -> Vec<String> {
    list_interfaces_in(Path::new("/sys/class/net"))
}

fn list_interfaces_in(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
