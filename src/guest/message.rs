//! Guest lifecycle messages
//!
//! Messages arrive over the guest lifecycle channel and carry the guest
//! type they are meant for, so several services can share one channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of guest a message or service belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestType {
    /// ARC container with multi-network support
    #[default]
    Arc,
    /// ARC container in single-network mode
    ArcLegacy,
    /// ARC running in a VM
    ArcVm,
    /// Termina VM
    TerminaVm,
    /// Plugin VM
    PluginVm,
}

impl GuestType {
    /// Whether this guest is one of the ARC variants
    pub fn is_arc(self) -> bool {
        matches!(self, GuestType::Arc | GuestType::ArcLegacy | GuestType::ArcVm)
    }

    /// Whether this guest mirrors host interfaces as separate devices
    pub fn is_multinet(self) -> bool {
        !matches!(self, GuestType::ArcLegacy)
    }

    /// Whether the guest runs in a VM (TAP-attached devices)
    pub fn is_vm(self) -> bool {
        matches!(self, GuestType::ArcVm | GuestType::TerminaVm | GuestType::PluginVm)
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuestType::Arc => "arc",
            GuestType::ArcLegacy => "arc_legacy",
            GuestType::ArcVm => "arc_vm",
            GuestType::TerminaVm => "termina_vm",
            GuestType::PluginVm => "plugin_vm",
        };
        f.write_str(name)
    }
}

/// Lifecycle event carried by a [`GuestMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    Start,
    Stop,
    DefaultInterfaceChanged,
    DeviceAdded,
    DeviceRemoved,
}

/// A guest lifecycle message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestMessage {
    pub guest_type: GuestType,
    pub event: GuestEvent,
    /// Interface name for device and default-interface events
    pub ifname: Option<String>,
}

impl GuestMessage {
    pub fn new(guest_type: GuestType, event: GuestEvent) -> Self {
        Self {
            guest_type,
            event,
            ifname: None,
        }
    }

    /// Attach an interface name payload
    pub fn with_ifname(mut self, ifname: impl Into<String>) -> Self {
        self.ifname = Some(ifname.into());
        self
    }

    pub fn start(guest_type: GuestType) -> Self {
        Self::new(guest_type, GuestEvent::Start)
    }

    pub fn stop(guest_type: GuestType) -> Self {
        Self::new(guest_type, GuestEvent::Stop)
    }
}
