//! Device presence probes
//!
//! The lifecycle loop polls a probe instead of waiting on hot-plug events, so
//! unplug detection works the same on every platform.

use std::path::{Path, PathBuf};

use crate::config::SerialConfig;
use crate::transport::PortAddress;

/// Answers "is the device there right now?"
pub trait DevicePresence: Send + Sync {
    /// Check presence; must return quickly
    fn is_present(&self) -> bool;
}

/// Presence of a device node on the filesystem
#[derive(Debug, Clone)]
pub struct PathPresence {
    path: PathBuf,
}

impl PathPresence {
    /// Probe the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DevicePresence for PathPresence {
    fn is_present(&self) -> bool {
        self.path.exists()
    }
}

/// Probe for transports with nothing to detect
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPresent;

impl DevicePresence for AlwaysPresent {
    fn is_present(&self) -> bool {
        true
    }
}

/// Pick the probe matching a serial config
///
/// Remote `serialproxy://` ports are always considered present; open failures
/// cover an unreachable peer.
pub fn presence_for(config: &SerialConfig) -> Box<dyn DevicePresence> {
    match PortAddress::parse(&config.device_name()) {
        Ok(PortAddress::Network { .. }) => Box::new(AlwaysPresent),
        _ => Box::new(PathPresence::new(&config.device)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_presence() {
        assert!(PathPresence::new(std::env::temp_dir()).is_present());
        assert!(!PathPresence::new("/dev/serialproxy-test-missing-device").is_present());
    }

    #[test]
    fn test_presence_for_network_device() {
        let config = SerialConfig {
            device: PathBuf::from("serialproxy://10.0.0.2:9990"),
            ..SerialConfig::default()
        };
        assert!(presence_for(&config).is_present());
    }
}
