//! Guest service dispatch shell

use crate::device::{Device, DeviceManager, DeviceObserver};
use crate::guest::message::{GuestEvent, GuestMessage, GuestType};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A deferred IPv6 setup retry requested by a service
///
/// The dispatcher turns it into a timer and delivers it back through
/// [`GuestService::on_ipv6_retry`] with the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub guest_type: GuestType,
    pub ifname: String,
    pub token: u64,
    pub delay: Duration,
}

/// Per-guest lifecycle handling
///
/// A service serves one guest type. The device manager is passed into
/// every call rather than held, so the dispatcher keeps sole ownership.
pub trait GuestService: DeviceObserver {
    fn guest_type(&self) -> GuestType;

    fn on_start(&mut self, _devices: &mut DeviceManager) {}

    fn on_stop(&mut self, _devices: &mut DeviceManager) {}

    /// Raw netlink datagram from the guest's network namespace
    fn on_link_message(&mut self, _buf: &[u8], _devices: &mut DeviceManager) {}

    /// A previously scheduled retry fired
    fn on_ipv6_retry(&mut self, _ifname: &str, _token: u64, _devices: &mut DeviceManager) {}

    /// Retries requested since the last call
    fn take_scheduled(&mut self) -> Vec<ScheduledRetry> {
        Vec::new()
    }

    /// Route a lifecycle message to the matching hook
    ///
    /// Messages for other guest types are ignored.
    fn dispatch_message(&mut self, msg: &GuestMessage, devices: &mut DeviceManager) {
        if msg.guest_type != self.guest_type() {
            trace!(guest = %msg.guest_type, "Ignoring message for another guest");
            return;
        }

        match msg.event {
            GuestEvent::Start => self.on_start(devices),
            GuestEvent::Stop => self.on_stop(devices),
            GuestEvent::DeviceAdded | GuestEvent::DeviceRemoved => {
                let Some(ifname) = msg.ifname.as_deref() else {
                    warn!(event = ?msg.event, "Device message without interface name");
                    return;
                };
                let Some(device) = devices.device_mut(ifname) else {
                    debug!(ifname, "Device message for unknown device");
                    return;
                };
                if msg.event == GuestEvent::DeviceAdded {
                    self.on_device_added(device);
                } else {
                    self.on_device_removed(device);
                }
            }
            GuestEvent::DefaultInterfaceChanged => {
                let ifname = msg.ifname.as_deref().unwrap_or_default();
                devices.on_default_interface_changed(ifname, &mut Forward(self));
            }
        }
    }
}

/// Lends a service to the device manager as its observer
struct Forward<'a, S: ?Sized>(&'a mut S);

impl<S: GuestService + ?Sized> DeviceObserver for Forward<'_, S> {
    fn on_device_added(&mut self, device: &mut Device) {
        self.0.on_device_added(device);
    }

    fn on_device_removed(&mut self, device: &mut Device) {
        self.0.on_device_removed(device);
    }

    fn on_default_interface_changed(&mut self, device: &mut Device, ifname: &str) {
        self.0.on_default_interface_changed(device, ifname);
    }
}
