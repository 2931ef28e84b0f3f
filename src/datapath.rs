//! Datapath collaborator
//!
//! The datapath creates bridges and TAPs and installs forwarding rules.
//! Calls are synchronous from the caller's point of view and report
//! failure through their return value.

use crate::device::Config;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Bridge, TAP and forwarding setup for devices
pub trait Datapath {
    /// Create the host-side bridge and guest link
    fn add_device(&mut self, config: &Config) -> bool;

    fn remove_device(&mut self, config: &Config);

    /// Create a TAP for a VM guest, returning its name
    fn add_tap(&mut self, config: &Config) -> Option<String>;

    fn remove_tap(&mut self, tap_ifname: &str);

    /// Routing table of a guest interface, `None` while it is not visible yet
    fn lookup_routing_table(&mut self, guest_ifname: &str) -> Option<i32>;

    fn setup_ipv6_forwarding(&mut self, config: &Config, table_id: i32) -> bool;

    fn teardown_ipv6_forwarding(&mut self, config: &Config);
}

/// A call made on a [`RecordingDatapath`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathCall {
    AddDevice(String),
    RemoveDevice(String),
    AddTap(String),
    RemoveTap(String),
    LookupRoutingTable(String),
    SetupIpv6 { host_ifname: String, table_id: i32 },
    TeardownIpv6(String),
}

/// In-memory datapath that records every call
///
/// Used by the simulator and by tests. Routing tables are either set
/// explicitly per guest interface or handed out from a base id.
#[derive(Debug, Default)]
pub struct RecordingDatapath {
    calls: Vec<DatapathCall>,
    fail_add: HashSet<String>,
    fail_ipv6: bool,
    tables: HashMap<String, i32>,
    table_base: Option<i32>,
    next_tap: u32,
}

impl RecordingDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign routing tables from `base` upwards to unknown guest interfaces
    pub fn with_table_base(mut self, base: i32) -> Self {
        self.table_base = Some(base);
        self
    }

    /// Make the next `add_device` for a host-side interface fail
    pub fn fail_add_once(&mut self, host_ifname: impl Into<String>) {
        self.fail_add.insert(host_ifname.into());
    }

    /// Make every IPv6 forwarding setup fail
    pub fn set_fail_ipv6(&mut self, fail: bool) {
        self.fail_ipv6 = fail;
    }

    pub fn set_routing_table(&mut self, guest_ifname: impl Into<String>, table_id: i32) {
        self.tables.insert(guest_ifname.into(), table_id);
    }

    pub fn clear_routing_table(&mut self, guest_ifname: &str) {
        self.tables.remove(guest_ifname);
    }

    pub fn calls(&self) -> &[DatapathCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<DatapathCall> {
        std::mem::take(&mut self.calls)
    }

    /// Number of recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&DatapathCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl Datapath for RecordingDatapath {
    fn add_device(&mut self, config: &Config) -> bool {
        let host_ifname = config.host_ifname().to_string();
        self.calls.push(DatapathCall::AddDevice(host_ifname.clone()));
        if self.fail_add.remove(&host_ifname) {
            debug!(ifname = %host_ifname, "Simulated add_device failure");
            return false;
        }
        debug!(
            ifname = %host_ifname,
            host_addr = %config.host_addr(),
            guest_addr = %config.guest_addr(),
            mac = %config.guest_mac(),
            "add_device"
        );
        true
    }

    fn remove_device(&mut self, config: &Config) {
        debug!(ifname = config.host_ifname(), "remove_device");
        self.calls
            .push(DatapathCall::RemoveDevice(config.host_ifname().to_string()));
    }

    fn add_tap(&mut self, config: &Config) -> Option<String> {
        let tap = format!("vmtap{}", self.next_tap);
        self.next_tap += 1;
        debug!(ifname = config.host_ifname(), tap = %tap, "add_tap");
        self.calls.push(DatapathCall::AddTap(tap.clone()));
        Some(tap)
    }

    fn remove_tap(&mut self, tap_ifname: &str) {
        debug!(tap = tap_ifname, "remove_tap");
        self.calls.push(DatapathCall::RemoveTap(tap_ifname.to_string()));
    }

    fn lookup_routing_table(&mut self, guest_ifname: &str) -> Option<i32> {
        self.calls
            .push(DatapathCall::LookupRoutingTable(guest_ifname.to_string()));
        if let Some(table_id) = self.tables.get(guest_ifname) {
            return Some(*table_id);
        }

        let base = self.table_base?;
        let table_id = base + self.tables.len() as i32;
        self.tables.insert(guest_ifname.to_string(), table_id);
        Some(table_id)
    }

    fn setup_ipv6_forwarding(&mut self, config: &Config, table_id: i32) -> bool {
        debug!(ifname = config.host_ifname(), table_id, "setup_ipv6_forwarding");
        self.calls.push(DatapathCall::SetupIpv6 {
            host_ifname: config.host_ifname().to_string(),
            table_id,
        });
        !self.fail_ipv6
    }

    fn teardown_ipv6_forwarding(&mut self, config: &Config) {
        debug!(ifname = config.host_ifname(), "teardown_ipv6_forwarding");
        self.calls
            .push(DatapathCall::TeardownIpv6(config.host_ifname().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;
    use crate::manifest::GuestnetConfig;

    #[test]
    fn test_routing_tables() {
        let mut datapath = RecordingDatapath::new();
        assert_eq!(datapath.lookup_routing_table("eth0"), None);

        datapath.set_routing_table("eth0", 1002);
        assert_eq!(datapath.lookup_routing_table("eth0"), Some(1002));
        datapath.clear_routing_table("eth0");
        assert_eq!(datapath.lookup_routing_table("eth0"), None);

        let mut datapath = RecordingDatapath::new().with_table_base(1000);
        assert_eq!(datapath.lookup_routing_table("arc0"), Some(1000));
        assert_eq!(datapath.lookup_routing_table("eth0"), Some(1001));
        assert_eq!(datapath.lookup_routing_table("arc0"), Some(1000));
    }

    #[test]
    fn test_fail_add_once() {
        let manager = DeviceManager::from_config(&GuestnetConfig::default());
        let device = manager.device("arc0").unwrap();

        let mut datapath = RecordingDatapath::new();
        datapath.fail_add_once("arcbr0");
        assert!(!datapath.add_device(device.config()));
        assert!(datapath.add_device(device.config()));
        assert_eq!(
            datapath.count(|c| matches!(c, DatapathCall::AddDevice(_))),
            2
        );
    }

    #[test]
    fn test_taps_are_numbered() {
        let manager = DeviceManager::from_config(&GuestnetConfig::default());
        let config = manager.device("arc0").unwrap().config();

        let mut datapath = RecordingDatapath::new();
        assert_eq!(datapath.add_tap(config).as_deref(), Some("vmtap0"));
        assert_eq!(datapath.add_tap(config).as_deref(), Some("vmtap1"));
        datapath.remove_tap("vmtap0");
        assert_eq!(
            datapath.take_calls().last(),
            Some(&DatapathCall::RemoveTap("vmtap0".to_string()))
        );
        assert!(datapath.calls().is_empty());
    }
}
