//! Configuration file parsing for guestnet
//!
//! Parses `guestnet.toml` configuration files using serde. Every section
//! has defaults, so an empty file describes the stock address layout.

use crate::error::{Error, Result};
use crate::guest::GuestType;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<GuestnetConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    GuestnetConfig::parse(&content)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestnetConfig {
    /// Guest settings
    #[serde(default)]
    pub guest: GuestConfig,

    /// Subnet class layout
    #[serde(default)]
    pub subnets: SubnetsConfig,

    /// Retry/backoff policy for IPv6 routing table lookups
    #[serde(default)]
    pub retry: RetryConfig,
}

impl GuestnetConfig {
    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: GuestnetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.guest.kind.is_arc() {
            return Err(Error::ConfigValidation(format!(
                "Guest kind '{}' is not served by the device manager",
                self.guest.kind
            )));
        }

        let classes = [
            ("android", &self.subnets.android),
            ("peripheral", &self.subnets.peripheral),
            ("container", &self.subnets.container),
        ];

        let mut ranges = Vec::with_capacity(classes.len());
        for (name, class) in classes {
            ranges.push((name, class.range(name)?));
        }

        // Class ranges must be disjoint
        for (i, (name, (start, end))) in ranges.iter().enumerate() {
            for (other, (other_start, other_end)) in ranges.iter().skip(i + 1) {
                if start < other_end && other_start < end {
                    return Err(Error::ConfigValidation(format!(
                        "Subnet class '{}' overlaps class '{}'",
                        name, other
                    )));
                }
            }
        }

        self.retry.validate()
    }
}

/// Guest settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestConfig {
    /// Guest type served by this instance
    #[serde(default)]
    pub kind: GuestType,

    /// Allocate a secondary subnet per device for containers nested in the guest
    #[serde(default)]
    pub nested_containers: bool,
}

/// Layout of the subnet classes
#[derive(Debug, Clone, Deserialize)]
pub struct SubnetsConfig {
    /// Reserved class for the primary Android device
    #[serde(default = "default_android_class")]
    pub android: SubnetClassConfig,

    /// Generic class shared by all other host interfaces
    #[serde(default = "default_peripheral_class")]
    pub peripheral: SubnetClassConfig,

    /// Secondary subnets for nested containers
    #[serde(default = "default_container_class")]
    pub container: SubnetClassConfig,
}

impl Default for SubnetsConfig {
    fn default() -> Self {
        Self {
            android: default_android_class(),
            peripheral: default_peripheral_class(),
            container: default_container_class(),
        }
    }
}

fn default_android_class() -> SubnetClassConfig {
    SubnetClassConfig::new(Ipv4Addr::new(100, 115, 92, 0), 30, 1)
}

fn default_peripheral_class() -> SubnetClassConfig {
    SubnetClassConfig::new(Ipv4Addr::new(100, 115, 92, 8), 30, 4)
}

fn default_container_class() -> SubnetClassConfig {
    SubnetClassConfig::new(Ipv4Addr::new(100, 115, 92, 192), 28, 4)
}

/// A run of equally sized, contiguous subnets
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubnetClassConfig {
    /// Network address of the first subnet
    pub base: Ipv4Addr,

    /// Prefix length of every subnet in the class
    pub prefix_len: u8,

    /// Number of subnets in the class
    pub count: u32,
}

impl SubnetClassConfig {
    pub fn new(base: Ipv4Addr, prefix_len: u8, count: u32) -> Self {
        Self {
            base,
            prefix_len,
            count,
        }
    }

    /// Number of addresses in one subnet of this class
    pub fn subnet_size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// Half-open address range `[start, end)` covered by the class
    fn range(&self, name: &str) -> Result<(u64, u64)> {
        if !(1..=30).contains(&self.prefix_len) {
            return Err(Error::ConfigValidation(format!(
                "Subnet class '{}' has prefix length {} (must be 1-30)",
                name, self.prefix_len
            )));
        }

        if self.count == 0 {
            return Err(Error::ConfigValidation(format!(
                "Subnet class '{}' must contain at least one subnet",
                name
            )));
        }

        let net = Ipv4Net::new(self.base, self.prefix_len)
            .map_err(|e| Error::ConfigValidation(format!("Subnet class '{}': {}", name, e)))?;
        if net.network() != self.base {
            return Err(Error::ConfigValidation(format!(
                "Subnet class '{}' base {} is not aligned to /{}",
                name, self.base, self.prefix_len
            )));
        }

        let start = u64::from(u32::from(self.base));
        let end = start + self.subnet_size() * u64::from(self.count);
        if end > 1u64 << 32 {
            return Err(Error::ConfigValidation(format!(
                "Subnet class '{}' runs past the end of the IPv4 space",
                name
            )));
        }

        Ok((start, end))
    }
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    10
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for IPv6 routing table lookups
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::ConfigValidation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(Error::ConfigValidation(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::ConfigValidation(
                "retry.jitter_factor must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}
