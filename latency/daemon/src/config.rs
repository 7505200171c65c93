//! Probe configuration
//!
//! Built by the binary from CLI arguments, optionally seeded from a JSON
//! file, and handed to the drivers by value.

use crate::types::{CorrelationMode, DeviceSide, Timestamp};
use anyhow::{bail, Context, Result};
use pktlat_common::DEFAULT_TABLE_CAPACITY;
use serde::{Deserialize, Deserializer};
use std::path::Path;

/// Default capacity of the completed-record channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default progress reporting interval in seconds
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10;

/// Runtime configuration shared by every capture point
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Which pipeline points complete a measurement
    pub mode: CorrelationMode,
    /// Number of slots in the correlation table
    pub table_capacity: usize,
    /// Device an outbound packet crosses first, matched against `dev=`
    pub outer_device: String,
    /// Device an outbound packet crosses second, matched against `dev=`
    pub inner_device: String,
    /// Offset added to every trace timestamp (`SECONDS.MICROS`)
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub trace_offset: Timestamp,
    /// Capacity of the channel carrying completed records
    pub channel_capacity: usize,
    /// Progress reporting interval in seconds (0 disables)
    pub progress_interval: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: CorrelationMode::Outbound,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            outer_device: String::new(),
            inner_device: String::new(),
            trace_offset: Timestamp::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ProbeConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Check the configuration before any driver starts
    pub fn validate(&self) -> Result<()> {
        if self.table_capacity == 0 {
            bail!("Table capacity must be >= 1");
        }
        if self.channel_capacity == 0 {
            bail!("Channel capacity must be >= 1");
        }
        if self.outer_device.is_empty() || self.inner_device.is_empty() {
            bail!("Both an outer and an inner device must be configured");
        }
        if self.outer_device == self.inner_device {
            bail!(
                "Outer and inner device must differ (both are {:?})",
                self.outer_device
            );
        }
        Ok(())
    }

    /// Check that the mode can complete when every source is a trace
    ///
    /// Trace events are keyed by skb address, and a reply never shares the
    /// request's skb, so a round trip needs echo-keyed packet captures.
    pub fn validate_trace_sources(&self) -> Result<()> {
        if self.mode == CorrelationMode::RoundTrip {
            bail!(
                "Mode round-trip needs echo-keyed packet captures; \
                 trace sources only support outbound or inbound"
            );
        }
        Ok(())
    }

    /// Which side a trace `dev=` value belongs to
    pub fn device_side(&self, dev: &[u8]) -> Option<DeviceSide> {
        if dev == self.outer_device.as_bytes() {
            Some(DeviceSide::Outer)
        } else if dev == self.inner_device.as_bytes() {
            Some(DeviceSide::Inner)
        } else {
            None
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse::<Timestamp>()
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> ProbeConfig {
        ProbeConfig {
            outer_device: "eth0".to_string(),
            inner_device: "veth0".to_string(),
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.mode, CorrelationMode::Outbound);
        assert_eq!(config.table_capacity, DEFAULT_TABLE_CAPACITY);
        assert_eq!(config.trace_offset, Timestamp::default());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(ProbeConfig::default().validate().is_err());

        let mut config = valid();
        config.table_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.inner_device = "eth0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trace_sources_reject_round_trip() {
        let mut config = valid();
        assert!(config.validate_trace_sources().is_ok());

        config.mode = CorrelationMode::Inbound;
        assert!(config.validate_trace_sources().is_ok());

        config.mode = CorrelationMode::RoundTrip;
        assert!(config.validate().is_ok());
        let err = config.validate_trace_sources().unwrap_err();
        assert!(err.to_string().contains("round-trip"));
    }

    #[test]
    fn test_device_side() {
        let config = valid();
        assert_eq!(config.device_side(b"eth0"), Some(DeviceSide::Outer));
        assert_eq!(config.device_side(b"veth0"), Some(DeviceSide::Inner));
        assert_eq!(config.device_side(b"eth"), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mode": "round-trip", "outer_device": "eth0", "inner_device": "tun0", "trace_offset": "1700000000.250000", "table_capacity": 256}}"#
        )
        .unwrap();

        let config = ProbeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mode, CorrelationMode::RoundTrip);
        assert_eq!(config.table_capacity, 256);
        assert_eq!(
            config.trace_offset,
            Timestamp::new(1_700_000_000, 250_000).unwrap()
        );
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_rejects_bad_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"trace_offset": "12."}}"#).unwrap();
        assert!(ProbeConfig::from_file(file.path()).is_err());
    }
}
