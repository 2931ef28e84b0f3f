//! Live device set and host interface reconciliation
//!
//! The manager is the only owner of devices and of the subnet pool.
//! Host interface list updates are diffed against the tracked set, so
//! duplicate or repeated notifications leave the device set unchanged.

use crate::device::context::Context;
use crate::device::types::{
    ANDROID_IFNAME, ANDROID_LEGACY_IFNAME, Config, Device, DeviceKind, Options,
};
use crate::guest::GuestType;
use crate::manifest::GuestnetConfig;
use crate::network::{MacAddress, SubnetClass, SubnetPool};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Receives device set changes
///
/// All methods default to no-ops.
pub trait DeviceObserver {
    fn on_device_added(&mut self, _device: &mut Device) {}

    fn on_device_removed(&mut self, _device: &mut Device) {}

    fn on_default_interface_changed(&mut self, _device: &mut Device, _ifname: &str) {}
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl DeviceObserver for NullObserver {}

/// One row of the device table
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub kind: DeviceKind,
    pub host_ifname: String,
    pub guest_ifname: String,
    pub subnet: String,
    pub host_addr: String,
    pub guest_addr: String,
    pub mac: MacAddress,
    pub nested_subnet: Option<String>,
    pub tap: Option<String>,
    pub started: bool,
    pub link_up: bool,
    pub ipv6_table: Option<i32>,
    pub routing_table_attempts: u32,
}

impl DeviceSummary {
    fn from_device(device: &Device) -> Self {
        let config = device.config();
        let arc = device.arc_context();

        Self {
            name: device.ifname().to_string(),
            kind: device.kind(),
            host_ifname: config.host_ifname().to_string(),
            guest_ifname: config.guest_ifname().to_string(),
            subnet: config.subnet().network().to_string(),
            host_addr: config.host_addr().to_string(),
            guest_addr: config.guest_addr().to_string(),
            mac: config.guest_mac(),
            nested_subnet: config.nested_subnet().map(|s| s.network().to_string()),
            tap: device.tap_ifname().map(str::to_string),
            started: device.is_started(),
            link_up: arc.is_some_and(|ctx| ctx.is_link_up()),
            ipv6_table: arc
                .filter(|ctx| ctx.has_ipv6())
                .map(|ctx| ctx.routing_table_id()),
            routing_table_attempts: arc.map_or(0, |ctx| ctx.attempts_made()),
        }
    }
}

/// Owner of the live device set
#[derive(Debug)]
pub struct DeviceManager {
    guest: GuestType,
    nested_containers: bool,
    pool: SubnetPool,
    devices: BTreeMap<String, Device>,
    /// Last host interface list, in enumeration order
    host_ifnames: Vec<String>,
    default_ifname: Option<String>,
}

impl DeviceManager {
    /// Create the manager and its primary Android device
    pub fn new(config: &GuestnetConfig, pool: SubnetPool) -> Self {
        let mut manager = Self {
            guest: config.guest.kind,
            nested_containers: config.guest.nested_containers,
            pool,
            devices: BTreeMap::new(),
            host_ifnames: Vec::new(),
            default_ifname: None,
        };

        let android = manager.android_ifname();
        if !manager.add(android, &mut NullObserver) {
            warn!(ifname = android, "Cannot create the primary Android device");
        }
        manager
    }

    /// Create the manager with a pool built from the configuration
    pub fn from_config(config: &GuestnetConfig) -> Self {
        Self::new(config, SubnetPool::new(&config.subnets))
    }

    pub fn guest_type(&self) -> GuestType {
        self.guest
    }

    /// Name of the primary Android device for this guest
    pub fn android_ifname(&self) -> &'static str {
        if self.guest.is_multinet() {
            ANDROID_IFNAME
        } else {
            ANDROID_LEGACY_IFNAME
        }
    }

    pub fn pool(&self) -> &SubnetPool {
        &self.pool
    }

    /// Build a device for a host interface without tracking it
    ///
    /// Returns `None` for unknown interface kinds and when the subnet class
    /// is exhausted. The caller owns the result and hands it back through
    /// [`DeviceManager::release_device`].
    pub fn make_device(&mut self, ifname: &str) -> Option<Device> {
        let Some(kind) = DeviceKind::classify(ifname) else {
            warn!(ifname, "Unknown interface kind, ignoring");
            return None;
        };

        let class = kind.subnet_class();
        let Some(mut subnet) = self.pool.allocate_subnet(class) else {
            warn!(ifname, %class, "Subnet pool exhausted, no device created");
            return None;
        };

        let Some((host_addr, guest_addr)) = SubnetPool::allocate_address_pair(&mut subnet) else {
            warn!(ifname, subnet = %subnet.network(), "Subnet too small for an address pair");
            self.pool.release(subnet);
            return None;
        };

        let nested = if self.nested_containers {
            match self.pool.allocate_subnet(SubnetClass::Container) {
                Some(nested) => Some(nested),
                None => {
                    warn!(ifname, "Container subnet pool exhausted, no device created");
                    subnet.release(host_addr);
                    subnet.release(guest_addr);
                    self.pool.release(subnet);
                    return None;
                }
            }
        } else {
            None
        };

        let (host_ifname, guest_ifname) = kind.ifnames(ifname);
        let mac = self.pool.generate_mac_address();
        let mut config = Config::new(host_ifname, guest_ifname, mac, subnet, host_addr, guest_addr);
        if let Some(nested) = nested {
            config = config.with_nested_subnet(nested);
        }

        Some(Device::new(
            ifname,
            kind,
            config,
            Options::for_kind(kind, self.guest.is_multinet()),
            Context::for_guest(self.guest),
        ))
    }

    /// Return a device's subnets and MAC address to the pool
    pub fn release_device(&mut self, device: Device) {
        self.pool.release_mac_address(device.config().guest_mac());
        let (subnet, nested) = device.into_config().into_subnets();
        self.pool.release(subnet);
        if let Some(nested) = nested {
            self.pool.release(nested);
        }
    }

    /// Create and track a device, notifying `observer`
    ///
    /// Returns false if the device already exists or cannot be built.
    pub fn add(&mut self, ifname: &str, observer: &mut dyn DeviceObserver) -> bool {
        if self.devices.contains_key(ifname) {
            return false;
        }
        let Some(device) = self.make_device(ifname) else {
            return false;
        };

        info!(
            ifname,
            kind = %device.kind(),
            host_ifname = device.config().host_ifname(),
            host_addr = %device.config().host_addr(),
            guest_addr = %device.config().guest_addr(),
            "Device created"
        );
        let device = self.devices.entry(ifname.to_string()).or_insert(device);
        observer.on_device_added(device);
        true
    }

    /// Stop tracking a device, notifying `observer` before its subnets are released
    pub fn remove(&mut self, ifname: &str, observer: &mut dyn DeviceObserver) -> bool {
        let Some(mut device) = self.devices.remove(ifname) else {
            return false;
        };

        observer.on_device_removed(&mut device);
        info!(ifname, "Device destroyed");
        self.release_device(device);
        true
    }

    pub fn exists(&self, ifname: &str) -> bool {
        self.devices.contains_key(ifname)
    }

    pub fn device(&self, ifname: &str) -> Option<&Device> {
        self.devices.get(ifname)
    }

    pub fn device_mut(&mut self, ifname: &str) -> Option<&mut Device> {
        self.devices.get_mut(ifname)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device whose guest-side interface has the given name
    pub fn find_by_guest_ifname_mut(&mut self, guest_ifname: &str) -> Option<&mut Device> {
        self.devices
            .values_mut()
            .find(|d| d.config().guest_ifname() == guest_ifname)
    }

    /// Reconcile the device set against the host interface list
    ///
    /// Devices for vanished interfaces are removed first, then devices are
    /// created for new interfaces in enumeration order. Single-network
    /// guests never get devices for host interfaces.
    pub fn on_interface_list_changed<I, S>(&mut self, ifnames: I, observer: &mut dyn DeviceObserver)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wanted: Vec<String> = Vec::new();
        for ifname in ifnames {
            let ifname = ifname.as_ref();
            if ifname.is_empty() || wanted.iter().any(|w| w == ifname) {
                continue;
            }
            if DeviceKind::classify(ifname).is_some_and(DeviceKind::is_android) {
                debug!(ifname, "Ignoring reserved interface name in host list");
                continue;
            }
            wanted.push(ifname.to_string());
        }

        let removed: Vec<String> = self
            .devices
            .values()
            .filter(|d| !d.kind().is_android() && !wanted.iter().any(|w| w == d.ifname()))
            .map(|d| d.ifname().to_string())
            .collect();
        for ifname in &removed {
            self.remove(ifname, observer);
        }

        self.host_ifnames = wanted;
        self.reconcile_additions(observer);
    }

    fn reconcile_additions(&mut self, observer: &mut dyn DeviceObserver) {
        if !self.guest.is_multinet() {
            debug!(guest = %self.guest, "Single-network guest, host interfaces not mirrored");
            return;
        }

        let ifnames = self.host_ifnames.clone();
        for ifname in &ifnames {
            if !self.exists(ifname) {
                self.add(ifname, observer);
            }
        }
    }

    /// Retry devices for known host interfaces when the guest starts
    ///
    /// Interfaces that found no free subnet earlier get another chance.
    pub fn on_guest_start(&mut self, guest: GuestType, observer: &mut dyn DeviceObserver) {
        if guest != self.guest {
            return;
        }
        debug!(%guest, "Guest started, reconciling host interfaces");
        self.reconcile_additions(observer);
    }

    /// Record a new host default interface
    ///
    /// Devices tracking the default interface are reported to `observer`.
    /// Repeating the current default is a no-op.
    pub fn on_default_interface_changed(&mut self, ifname: &str, observer: &mut dyn DeviceObserver) {
        if self.default_ifname.as_deref() == Some(ifname) {
            return;
        }
        info!(
            previous = self.default_ifname.as_deref().unwrap_or("none"),
            ifname, "Default interface changed"
        );
        self.default_ifname = (!ifname.is_empty()).then(|| ifname.to_string());

        for device in self.default_interface_devices_mut() {
            observer.on_default_interface_changed(device, ifname);
        }
    }

    pub fn default_interface(&self) -> Option<&str> {
        self.default_ifname.as_deref()
    }

    /// Devices that follow the host's default interface
    pub fn default_interface_devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices
            .values_mut()
            .filter(|d| d.uses_default_interface())
    }

    /// Remove every device, primary device included
    pub fn shutdown(&mut self, observer: &mut dyn DeviceObserver) {
        let ifnames: Vec<String> = self.devices.keys().cloned().collect();
        for ifname in &ifnames {
            self.remove(ifname, observer);
        }
        self.host_ifnames.clear();
        self.default_ifname = None;
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.devices.values().map(DeviceSummary::from_device).collect()
    }
}
