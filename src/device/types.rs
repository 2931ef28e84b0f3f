//! Device identity, addressing and per-kind options

use crate::device::context::{ArcContext, Context};
use crate::network::{MacAddress, Subnet, SubnetAddress, SubnetClass};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Kernel interface name limit (IFNAMSIZ minus the terminator)
pub const IFNAME_MAX_LEN: usize = 15;

/// Device name of the primary Android device with multi-network support
pub const ANDROID_IFNAME: &str = "arc0";

/// Device name of the primary Android device in single-network mode
pub const ANDROID_LEGACY_IFNAME: &str = "android";

/// Host-side bridge of the primary Android device
pub const ANDROID_BRIDGE: &str = "arcbr0";

/// Host-side bridge prefix for every other device
const BRIDGE_PREFIX: &str = "arc_";

const ETHERNET_PREFIXES: &[&str] = &["eth", "usb"];
const WIFI_PREFIXES: &[&str] = &["wlan", "mlan"];
const CELLULAR_PREFIXES: &[&str] = &["wwan", "rmnet", "mbimmux"];
const VPN_PREFIXES: &[&str] = &["tun", "wg", "ppp"];

/// Kind of device, derived from the host interface name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Ethernet,
    Wifi,
    Cellular,
    VpnTunnel,
    /// Primary device of a multi-network Android guest
    Android,
    /// Primary device of a single-network Android guest
    AndroidLegacy,
}

impl DeviceKind {
    /// Classify a host interface name
    ///
    /// Returns `None` for names matching no known pattern.
    pub fn classify(ifname: &str) -> Option<Self> {
        let has_prefix = |prefixes: &[&str]| prefixes.iter().any(|p| ifname.starts_with(p));

        if ifname == ANDROID_IFNAME {
            Some(DeviceKind::Android)
        } else if ifname == ANDROID_LEGACY_IFNAME {
            Some(DeviceKind::AndroidLegacy)
        } else if has_prefix(ETHERNET_PREFIXES) {
            Some(DeviceKind::Ethernet)
        } else if has_prefix(WIFI_PREFIXES) {
            Some(DeviceKind::Wifi)
        } else if has_prefix(CELLULAR_PREFIXES) {
            Some(DeviceKind::Cellular)
        } else if has_prefix(VPN_PREFIXES) {
            Some(DeviceKind::VpnTunnel)
        } else {
            None
        }
    }

    /// Whether this is one of the primary Android device kinds
    pub fn is_android(self) -> bool {
        matches!(self, DeviceKind::Android | DeviceKind::AndroidLegacy)
    }

    /// Subnet class devices of this kind draw from
    pub fn subnet_class(self) -> SubnetClass {
        if self.is_android() {
            SubnetClass::Android
        } else {
            SubnetClass::Peripheral
        }
    }

    /// Host-side and guest-side interface names for a device
    pub fn ifnames(self, ifname: &str) -> (String, String) {
        if self.is_android() {
            return (ANDROID_BRIDGE.to_string(), ANDROID_IFNAME.to_string());
        }

        let host: String = format!("{}{}", BRIDGE_PREFIX, ifname)
            .chars()
            .take(IFNAME_MAX_LEN)
            .collect();
        (host, ifname.to_string())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Ethernet => "ethernet",
            DeviceKind::Wifi => "wifi",
            DeviceKind::Cellular => "cellular",
            DeviceKind::VpnTunnel => "vpn",
            DeviceKind::Android => "android",
            DeviceKind::AndroidLegacy => "android_legacy",
        };
        f.write_str(name)
    }
}

/// Static per-kind device flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Options {
    /// Forward multicast between host and guest
    pub fwd_multicast: bool,
    /// Look up a routing table and set up IPv6 forwarding
    pub find_ipv6_routes: bool,
    /// IPv6 is allowed on this device at all
    pub ipv6_enabled: bool,
    /// Device follows the host's default interface
    pub use_default_interface: bool,
}

impl Options {
    /// Preset for a device kind
    ///
    /// `multinet` is whether the guest mirrors host interfaces; the legacy
    /// device only looks for IPv6 routes when it does not.
    pub fn for_kind(kind: DeviceKind, multinet: bool) -> Self {
        match kind {
            DeviceKind::Ethernet | DeviceKind::Wifi => Options {
                fwd_multicast: true,
                find_ipv6_routes: true,
                ipv6_enabled: true,
                use_default_interface: false,
            },
            DeviceKind::Cellular => Options {
                fwd_multicast: false,
                find_ipv6_routes: false,
                ipv6_enabled: true,
                use_default_interface: false,
            },
            DeviceKind::VpnTunnel => Options::default(),
            DeviceKind::Android => Options {
                fwd_multicast: false,
                find_ipv6_routes: true,
                ipv6_enabled: true,
                use_default_interface: false,
            },
            DeviceKind::AndroidLegacy => Options {
                fwd_multicast: true,
                find_ipv6_routes: !multinet,
                ipv6_enabled: true,
                use_default_interface: true,
            },
        }
    }
}

/// Addressing bundle fixed at device construction
///
/// Owns the subnet and both addresses; they go back to the pool through
/// [`Config::into_subnets`] when the device is destroyed.
#[derive(Debug)]
pub struct Config {
    host_ifname: String,
    guest_ifname: String,
    guest_mac: MacAddress,
    subnet: Subnet,
    host_addr: SubnetAddress,
    guest_addr: SubnetAddress,
    nested_subnet: Option<Subnet>,
}

impl Config {
    pub fn new(
        host_ifname: impl Into<String>,
        guest_ifname: impl Into<String>,
        guest_mac: MacAddress,
        subnet: Subnet,
        host_addr: SubnetAddress,
        guest_addr: SubnetAddress,
    ) -> Self {
        Self {
            host_ifname: host_ifname.into(),
            guest_ifname: guest_ifname.into(),
            guest_mac,
            subnet,
            host_addr,
            guest_addr,
            nested_subnet: None,
        }
    }

    /// Attach a secondary subnet for containers nested in the guest
    pub fn with_nested_subnet(mut self, subnet: Subnet) -> Self {
        self.nested_subnet = Some(subnet);
        self
    }

    pub fn host_ifname(&self) -> &str {
        &self.host_ifname
    }

    pub fn guest_ifname(&self) -> &str {
        &self.guest_ifname
    }

    pub fn guest_mac(&self) -> MacAddress {
        self.guest_mac
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    pub fn host_addr(&self) -> &SubnetAddress {
        &self.host_addr
    }

    pub fn guest_addr(&self) -> &SubnetAddress {
        &self.guest_addr
    }

    pub fn host_ipv4_addr(&self) -> Ipv4Addr {
        self.host_addr.addr()
    }

    pub fn guest_ipv4_addr(&self) -> Ipv4Addr {
        self.guest_addr.addr()
    }

    pub fn nested_subnet(&self) -> Option<&Subnet> {
        self.nested_subnet.as_ref()
    }

    /// Give the addresses back to the subnet and hand out the subnets
    pub fn into_subnets(self) -> (Subnet, Option<Subnet>) {
        let mut subnet = self.subnet;
        subnet.release(self.host_addr);
        subnet.release(self.guest_addr);
        (subnet, self.nested_subnet)
    }
}

/// A virtual link between one host interface and the guest
#[derive(Debug)]
pub struct Device {
    ifname: String,
    kind: DeviceKind,
    config: Config,
    options: Options,
    tap_ifname: Option<String>,
    context: Context,
}

impl Device {
    /// Create a device for a host interface
    ///
    /// # Panics
    ///
    /// Panics if `ifname` is empty.
    pub fn new(
        ifname: impl Into<String>,
        kind: DeviceKind,
        config: Config,
        options: Options,
        context: Context,
    ) -> Self {
        let ifname = ifname.into();
        assert!(!ifname.is_empty(), "device requires a host interface name");

        Self {
            ifname,
            kind,
            config,
            options,
            tap_ifname: None,
            context,
        }
    }

    /// Host interface name this device is keyed by
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn uses_default_interface(&self) -> bool {
        self.options.use_default_interface
    }

    /// TAP interface attached by a VM guest, if any yet
    pub fn tap_ifname(&self) -> Option<&str> {
        self.tap_ifname.as_deref()
    }

    pub fn set_tap_ifname(&mut self, tap_ifname: impl Into<String>) {
        self.tap_ifname = Some(tap_ifname.into());
    }

    pub fn clear_tap_ifname(&mut self) -> Option<String> {
        self.tap_ifname.take()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn arc_context(&self) -> Option<&ArcContext> {
        self.context.as_arc()
    }

    pub fn arc_context_mut(&mut self) -> Option<&mut ArcContext> {
        self.context.as_arc_mut()
    }

    pub fn is_started(&self) -> bool {
        self.context.is_started()
    }

    /// Tear the device apart, keeping only what goes back to the pool
    pub fn into_config(self) -> Config {
        self.config
    }
}
