//! Device orchestration for ARC guests
//!
//! `ArcService` starts and stops device datapaths with the guest, follows
//! guest-side link state from netlink notifications and configures IPv6
//! once a routing table for the guest interface can be found.
//!
//! Routing table lookups that come back empty are retried with exponential
//! backoff up to `retry.max_attempts`. Retries are handed to the dispatcher
//! as [`ScheduledRetry`] values; each device has at most one live retry
//! token, and stopping, removing, link loss or IPv6 teardown invalidate it.

use crate::datapath::Datapath;
use crate::device::{Context, Device, DeviceManager, DeviceObserver};
use crate::guest::message::GuestType;
use crate::guest::service::{GuestService, ScheduledRetry};
use crate::manifest::RetryConfig;
use crate::network::parse_link_messages;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Outcome of an IPv6 setup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Setup {
    /// Forwarding installed on this routing table
    Ready(i32),
    /// IPv6 was already configured
    AlreadyConfigured,
    /// No routing table yet, another attempt is scheduled
    Retrying(Duration),
    /// No routing table after the last allowed attempt
    GaveUp,
    /// Invalid routing table or forwarding setup failed
    Failed,
    /// Device does not take IPv6
    Unsupported,
}

/// Live retry for one device
#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    token: u64,
    /// Attempts made in the current setup cycle
    attempt: u8,
}

/// Create backoff strategy from RetryConfig
fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Guest service for the ARC guest variants
pub struct ArcService<D: Datapath> {
    guest_type: GuestType,
    datapath: D,
    /// Whether the guest is up
    running: bool,
    backoff: ExponentialBackoff,
    pending: HashMap<String, PendingRetry>,
    next_token: u64,
    scheduled: Vec<ScheduledRetry>,
}

impl<D: Datapath> ArcService<D> {
    /// Create a service for an ARC guest type
    ///
    /// # Panics
    ///
    /// Panics if `guest_type` is not an ARC variant.
    pub fn new(guest_type: GuestType, datapath: D, retry: &RetryConfig) -> Self {
        assert!(guest_type.is_arc(), "ArcService needs an ARC guest, got {}", guest_type);

        Self {
            guest_type,
            datapath,
            running: false,
            backoff: backoff_from_config(retry),
            pending: HashMap::new(),
            next_token: 0,
            scheduled: Vec::new(),
        }
    }

    pub fn datapath(&self) -> &D {
        &self.datapath
    }

    pub fn datapath_mut(&mut self) -> &mut D {
        &mut self.datapath
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_pending_retry(&self, ifname: &str) -> bool {
        self.pending.contains_key(ifname)
    }

    /// Bring up the datapath of one device
    ///
    /// Starting a started device is a no-op. IPv6 setup follows right away
    /// when the guest link is already up.
    pub fn start_device(&mut self, device: &mut Device) -> bool {
        if device.is_started() {
            return true;
        }

        if !self.datapath.add_device(device.config()) {
            warn!(ifname = device.ifname(), "Datapath failed to add device");
            return false;
        }

        if matches!(device.context(), Context::Vm(_)) {
            match self.datapath.add_tap(device.config()) {
                Some(tap) => device.set_tap_ifname(tap),
                None => {
                    warn!(ifname = device.ifname(), "Datapath failed to create TAP");
                    self.datapath.remove_device(device.config());
                    return false;
                }
            }
        }

        device.context_mut().set_started(true);
        info!(
            ifname = device.ifname(),
            host_ifname = device.config().host_ifname(),
            tap = device.tap_ifname().unwrap_or("-"),
            "Device started"
        );

        let link_up = device.arc_context().is_some_and(|ctx| ctx.is_link_up());
        if link_up && device.options().find_ipv6_routes {
            self.setup_ipv6(device);
        }
        true
    }

    /// Tear down the datapath of one device
    pub fn stop_device(&mut self, device: &mut Device) {
        self.teardown_ipv6(device);
        if !device.is_started() {
            return;
        }

        if let Some(tap) = device.clear_tap_ifname() {
            self.datapath.remove_tap(&tap);
        }
        self.datapath.remove_device(device.config());
        device.context_mut().set_started(false);
        info!(ifname = device.ifname(), "Device stopped");
    }

    /// Apply link notifications from the guest's netlink socket
    ///
    /// Only transitions matter. Going up starts a device the guest brought
    /// up late, or sets up IPv6 for one already started. Going down
    /// drops IPv6.
    pub fn link_msg_handler(&mut self, buf: &[u8], devices: &mut DeviceManager) {
        for msg in parse_link_messages(buf) {
            let Some(device) = devices.find_by_guest_ifname_mut(&msg.ifname) else {
                trace!(ifname = %msg.ifname, "Link message for untracked interface");
                continue;
            };
            let up = msg.is_up();
            let Some(ctx) = device.arc_context_mut() else {
                continue;
            };
            if !ctx.set_link_up(up) {
                continue;
            }
            let started = ctx.is_started();
            info!(ifname = device.ifname(), up, "Guest link changed");

            if !up {
                self.teardown_ipv6(device);
            } else if !started {
                if self.running {
                    self.start_device(device);
                }
            } else if device.options().find_ipv6_routes {
                self.setup_ipv6(device);
            }
        }
    }

    /// Start a fresh IPv6 setup cycle for a device
    pub fn setup_ipv6(&mut self, device: &mut Device) -> Ipv6Setup {
        self.cancel_retry(device.ifname());
        self.attempt_ipv6(device, 0)
    }

    fn attempt_ipv6(&mut self, device: &mut Device, previous: u8) -> Ipv6Setup {
        if !device.options().ipv6_enabled {
            return Ipv6Setup::Unsupported;
        }
        let Some(ctx) = device.arc_context_mut() else {
            return Ipv6Setup::Unsupported;
        };
        if ctx.has_ipv6() {
            return Ipv6Setup::AlreadyConfigured;
        }
        let total = ctx.routing_table_attempts();
        let attempt = previous.saturating_add(1);
        let ifname = device.ifname().to_string();

        let Some(table_id) = self
            .datapath
            .lookup_routing_table(device.config().guest_ifname())
        else {
            return self.schedule_retry(ifname, attempt);
        };

        let accepted = device
            .arc_context_mut()
            .is_some_and(|ctx| ctx.set_has_ipv6(table_id));
        if !accepted {
            warn!(%ifname, table_id, "Rejecting invalid routing table id");
            return Ipv6Setup::Failed;
        }

        if !self.datapath.setup_ipv6_forwarding(device.config(), table_id) {
            warn!(%ifname, table_id, "Datapath failed to set up IPv6 forwarding");
            if let Some(ctx) = device.arc_context_mut() {
                ctx.clear_ipv6();
            }
            return Ipv6Setup::Failed;
        }

        info!(%ifname, table_id, attempts = total + 1, "IPv6 configured");
        Ipv6Setup::Ready(table_id)
    }

    fn schedule_retry(&mut self, ifname: String, attempt: u8) -> Ipv6Setup {
        let delay_ms = if self.backoff.should_retry(attempt) {
            self.backoff.delay(attempt, &mut rng())
        } else {
            None
        };
        let Some(delay_ms) = delay_ms else {
            warn!(%ifname, attempts = attempt, "No routing table found, giving up on IPv6");
            return Ipv6Setup::GaveUp;
        };

        let token = self.next_token;
        self.next_token += 1;
        let delay = Duration::from_millis(delay_ms);
        debug!(%ifname, attempt, delay_ms, "No routing table yet, retry scheduled");

        self.pending
            .insert(ifname.clone(), PendingRetry { token, attempt });
        self.scheduled.push(ScheduledRetry {
            guest_type: self.guest_type,
            ifname,
            token,
            delay,
        });
        Ipv6Setup::Retrying(delay)
    }

    /// Drop IPv6 state of a device
    ///
    /// Always succeeds, whether or not IPv6 was configured.
    pub fn teardown_ipv6(&mut self, device: &mut Device) {
        self.cancel_retry(device.ifname());

        let had_ipv6 = device.arc_context().is_some_and(|ctx| ctx.has_ipv6());
        if had_ipv6 {
            self.datapath.teardown_ipv6_forwarding(device.config());
            debug!(ifname = device.ifname(), "IPv6 torn down");
        }
        if let Some(ctx) = device.arc_context_mut() {
            ctx.clear_ipv6();
        }
    }

    fn cancel_retry(&mut self, ifname: &str) {
        if self.pending.remove(ifname).is_some() {
            debug!(ifname, "Cancelled pending IPv6 retry");
        }
    }
}

impl<D: Datapath> DeviceObserver for ArcService<D> {
    fn on_device_added(&mut self, device: &mut Device) {
        if self.running {
            self.start_device(device);
        }
    }

    fn on_device_removed(&mut self, device: &mut Device) {
        self.stop_device(device);
    }

    fn on_default_interface_changed(&mut self, device: &mut Device, ifname: &str) {
        let link_up = device.arc_context().is_some_and(|ctx| ctx.is_link_up());
        if !device.is_started() || !link_up || !device.options().find_ipv6_routes {
            return;
        }
        debug!(device = device.ifname(), ifname, "Default interface changed, redoing IPv6");
        self.teardown_ipv6(device);
        self.setup_ipv6(device);
    }
}

impl<D: Datapath> GuestService for ArcService<D> {
    fn guest_type(&self) -> GuestType {
        self.guest_type
    }

    fn on_start(&mut self, devices: &mut DeviceManager) {
        info!(guest = %self.guest_type, "Guest started");
        self.running = true;
        for device in devices.devices_mut() {
            self.start_device(device);
        }
    }

    fn on_stop(&mut self, devices: &mut DeviceManager) {
        info!(guest = %self.guest_type, "Guest stopped");
        for device in devices.devices_mut() {
            self.stop_device(device);
            // The guest namespace is gone along with its links
            if let Some(ctx) = device.arc_context_mut() {
                ctx.reset();
            }
        }
        self.running = false;
        self.pending.clear();
    }

    fn on_link_message(&mut self, buf: &[u8], devices: &mut DeviceManager) {
        self.link_msg_handler(buf, devices);
    }

    fn on_ipv6_retry(&mut self, ifname: &str, token: u64, devices: &mut DeviceManager) {
        let live = self.pending.get(ifname).is_some_and(|p| p.token == token);
        if !live {
            debug!(ifname, token, "Dropping stale IPv6 retry");
            return;
        }
        let Some(pending) = self.pending.remove(ifname) else {
            return;
        };

        let Some(device) = devices.device_mut(ifname) else {
            debug!(ifname, "IPv6 retry for a removed device");
            return;
        };
        let link_up = device.arc_context().is_some_and(|ctx| ctx.is_link_up());
        if !device.is_started() || !link_up {
            debug!(ifname, "Device no longer ready for IPv6");
            return;
        }
        self.attempt_ipv6(device, pending.attempt);
    }

    fn take_scheduled(&mut self) -> Vec<ScheduledRetry> {
        std::mem::take(&mut self.scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{DatapathCall, RecordingDatapath};
    use crate::device::NullObserver;
    use crate::guest::message::{GuestEvent, GuestMessage};
    use crate::manifest::GuestnetConfig;
    use crate::network::netlink::{IFF_UP, LinkMessage, LinkMessageKind};
    use crate::network::{MacAddressGenerator, SubnetPool};

    fn retry(max_attempts: u8) -> RetryConfig {
        RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts,
            jitter_factor: 0.0,
        }
    }

    fn service(guest: GuestType) -> ArcService<RecordingDatapath> {
        ArcService::new(guest, RecordingDatapath::new(), &retry(5))
    }

    fn devices(guest: GuestType) -> DeviceManager {
        let mut config = GuestnetConfig::default();
        config.guest.kind = guest;
        let pool = SubnetPool::with_mac_generator(&config.subnets, MacAddressGenerator::from_seed(1));
        DeviceManager::new(&config, pool)
    }

    fn link(ifname: &str, up: bool) -> Vec<u8> {
        let flags = if up { IFF_UP } else { 0 };
        LinkMessage::new(LinkMessageKind::New, 2, ifname, flags).encode()
    }

    fn adds(svc: &ArcService<RecordingDatapath>, host_ifname: &str) -> usize {
        svc.datapath()
            .count(|c| *c == DatapathCall::AddDevice(host_ifname.to_string()))
    }

    fn lookups(svc: &ArcService<RecordingDatapath>) -> usize {
        svc.datapath()
            .count(|c| matches!(c, DatapathCall::LookupRoutingTable(_)))
    }

    #[test]
    #[should_panic(expected = "ARC guest")]
    fn test_rejects_non_arc_guest() {
        service(GuestType::PluginVm);
    }

    #[test]
    fn test_start_starts_all_devices() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        devices.on_interface_list_changed(["eth0", "wlan0"], &mut svc);
        assert!(svc.datapath().calls().is_empty());

        svc.on_start(&mut devices);
        assert!(svc.is_running());
        assert!(devices.devices().all(Device::is_started));
        assert_eq!(adds(&svc, "arcbr0"), 1);
        assert_eq!(adds(&svc, "arc_eth0"), 1);
        assert_eq!(adds(&svc, "arc_wlan0"), 1);
    }

    #[test]
    fn test_incremental_add_and_remove() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);

        devices.on_interface_list_changed(["eth0"], &mut svc);
        assert!(devices.device("eth0").unwrap().is_started());

        devices.on_interface_list_changed(Vec::<String>::new(), &mut svc);
        assert!(!devices.exists("eth0"));
        assert_eq!(
            svc.datapath()
                .count(|c| *c == DatapathCall::RemoveDevice("arc_eth0".to_string())),
            1
        );
    }

    #[test]
    fn test_link_up_starts_device_exactly_once() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.datapath_mut().fail_add_once("arcbr0");
        svc.datapath_mut().set_routing_table("arc0", 1001);

        svc.on_start(&mut devices);
        assert!(!devices.device("arc0").unwrap().is_started());
        assert_eq!(adds(&svc, "arcbr0"), 1);

        svc.on_link_message(&link("arc0", true), &mut devices);
        let arc0 = devices.device("arc0").unwrap();
        assert!(arc0.is_started());
        assert_eq!(arc0.arc_context().unwrap().routing_table_id(), 1001);
        assert_eq!(adds(&svc, "arcbr0"), 2);

        // Repeated up notifications are no-ops
        svc.on_link_message(&link("arc0", true), &mut devices);
        let mut batch = link("arc0", true);
        batch.extend(link("arc0", true));
        svc.on_link_message(&batch, &mut devices);
        assert_eq!(adds(&svc, "arcbr0"), 2);
        assert_eq!(lookups(&svc), 1);
    }

    #[test]
    fn test_link_up_before_guest_start() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);

        svc.on_link_message(&link("arc0", true), &mut devices);
        let arc0 = devices.device("arc0").unwrap();
        assert!(!arc0.is_started());
        assert!(arc0.arc_context().unwrap().is_link_up());
        assert!(svc.datapath().calls().is_empty());

        // Link already up at start time: IPv6 setup follows immediately
        svc.datapath_mut().set_routing_table("arc0", 7);
        svc.on_start(&mut devices);
        assert!(devices.device("arc0").unwrap().arc_context().unwrap().has_ipv6());
    }

    #[test]
    fn test_garbage_link_messages_ignored() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);

        svc.on_link_message(&[0xde, 0xad, 0xbe, 0xef], &mut devices);
        svc.on_link_message(&link("eth9", true), &mut devices);
        assert!(!devices.device("arc0").unwrap().arc_context().unwrap().is_link_up());
    }

    #[test]
    fn test_ipv6_retry_until_table_appears() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);

        svc.on_link_message(&link("arc0", true), &mut devices);
        let scheduled = svc.take_scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].ifname, "arc0");
        assert_eq!(scheduled[0].guest_type, GuestType::Arc);
        assert!(svc.has_pending_retry("arc0"));

        svc.datapath_mut().set_routing_table("arc0", 1003);
        svc.on_ipv6_retry("arc0", scheduled[0].token, &mut devices);

        let ctx = devices.device("arc0").unwrap().arc_context().unwrap();
        assert!(ctx.has_ipv6());
        assert_eq!(ctx.routing_table_id(), 1003);
        assert_eq!(ctx.attempts_made(), 2);
        assert!(!svc.has_pending_retry("arc0"));

        // The same token again is stale
        svc.on_ipv6_retry("arc0", scheduled[0].token, &mut devices);
        assert_eq!(lookups(&svc), 2);
    }

    /// Fire every scheduled retry until none are left
    fn run_retries(svc: &mut ArcService<RecordingDatapath>, devices: &mut DeviceManager) {
        for _ in 0..32 {
            let scheduled = svc.take_scheduled();
            if scheduled.is_empty() {
                return;
            }
            for retry in scheduled {
                svc.on_ipv6_retry(&retry.ifname, retry.token, devices);
            }
        }
        panic!("retries never ran out");
    }

    #[test]
    fn test_ipv6_retry_gives_up() {
        for max_attempts in [1u8, 2, 3, 5] {
            let mut devices = devices(GuestType::Arc);
            let mut svc =
                ArcService::new(GuestType::Arc, RecordingDatapath::new(), &retry(max_attempts));
            svc.on_start(&mut devices);
            svc.on_link_message(&link("arc0", true), &mut devices);
            run_retries(&mut svc, &mut devices);

            assert!(!svc.has_pending_retry("arc0"));
            assert_eq!(lookups(&svc), max_attempts as usize, "max_attempts = {max_attempts}");
            let ctx = devices.device("arc0").unwrap().arc_context().unwrap();
            assert!(!ctx.has_ipv6());
            assert_eq!(ctx.attempts_made(), max_attempts as u32);
        }
    }

    #[test]
    fn test_single_attempt_schedules_nothing() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = ArcService::new(GuestType::Arc, RecordingDatapath::new(), &retry(1));
        svc.on_start(&mut devices);

        let arc0 = devices.device_mut("arc0").unwrap();
        arc0.arc_context_mut().unwrap().set_link_up(true);
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::GaveUp);
        assert!(svc.take_scheduled().is_empty());

        // A new cycle starts from scratch
        svc.datapath_mut().set_routing_table("arc0", 12);
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::Ready(12));
        assert_eq!(arc0.arc_context().unwrap().attempts_made(), 2);
    }

    #[test]
    fn test_link_down_cancels_retry_and_ipv6() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);
        devices.on_interface_list_changed(["eth0"], &mut svc);

        svc.on_link_message(&link("eth0", true), &mut devices);
        let token = svc.take_scheduled()[0].token;

        svc.on_link_message(&link("eth0", false), &mut devices);
        assert!(!svc.has_pending_retry("eth0"));
        svc.on_ipv6_retry("eth0", token, &mut devices);
        assert_eq!(lookups(&svc), 1);

        // With a table, down tears IPv6 down again
        svc.datapath_mut().set_routing_table("eth0", 1010);
        svc.on_link_message(&link("eth0", true), &mut devices);
        assert!(devices.device("eth0").unwrap().arc_context().unwrap().has_ipv6());
        svc.on_link_message(&link("eth0", false), &mut devices);

        let ctx = devices.device("eth0").unwrap().arc_context().unwrap();
        assert!(!ctx.has_ipv6());
        assert_eq!(
            svc.datapath()
                .count(|c| *c == DatapathCall::TeardownIpv6("arc_eth0".to_string())),
            1
        );
    }

    #[test]
    fn test_removal_cancels_retry() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);
        devices.on_interface_list_changed(["eth0"], &mut svc);
        svc.on_link_message(&link("eth0", true), &mut devices);
        let token = svc.take_scheduled()[0].token;

        devices.on_interface_list_changed(Vec::<String>::new(), &mut svc);
        assert!(!svc.has_pending_retry("eth0"));

        // A new device with the same name does not inherit the old retry
        devices.on_interface_list_changed(["eth0"], &mut svc);
        svc.on_ipv6_retry("eth0", token, &mut devices);
        assert_eq!(lookups(&svc), 1);
    }

    #[test]
    fn test_invalid_table_rejected() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);
        svc.datapath_mut().set_routing_table("arc0", -3);

        let arc0 = devices.device_mut("arc0").unwrap();
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::Failed);
        assert!(!arc0.arc_context().unwrap().has_ipv6());
    }

    #[test]
    fn test_forwarding_failure_clears_ipv6() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        svc.on_start(&mut devices);
        svc.datapath_mut().set_routing_table("arc0", 4);
        svc.datapath_mut().set_fail_ipv6(true);

        let arc0 = devices.device_mut("arc0").unwrap();
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::Failed);
        assert!(!arc0.arc_context().unwrap().has_ipv6());

        svc.datapath_mut().set_fail_ipv6(false);
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::Ready(4));
        assert_eq!(svc.setup_ipv6(arc0), Ipv6Setup::AlreadyConfigured);
    }

    #[test]
    fn test_ipv6_by_device_kind() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc).with_tables();
        svc.on_start(&mut devices);
        devices.on_interface_list_changed(["wwan0", "tun0"], &mut svc);

        // Cellular does not look for routes on link up
        svc.on_link_message(&link("wwan0", true), &mut devices);
        assert_eq!(lookups(&svc), 0);

        let tun0 = devices.device_mut("tun0").unwrap();
        assert_eq!(svc.setup_ipv6(tun0), Ipv6Setup::Unsupported);
    }

    #[test]
    fn test_teardown_always_succeeds() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc);
        let arc0 = devices.device_mut("arc0").unwrap();

        svc.teardown_ipv6(arc0);
        assert!(!arc0.arc_context().unwrap().has_ipv6());
        assert!(svc.datapath().calls().is_empty());
    }

    #[test]
    fn test_stop_resets_devices() {
        let mut devices = devices(GuestType::Arc);
        let mut svc = service(GuestType::Arc).with_tables();
        svc.on_start(&mut devices);
        svc.on_link_message(&link("arc0", true), &mut devices);
        assert!(devices.device("arc0").unwrap().arc_context().unwrap().has_ipv6());

        svc.on_stop(&mut devices);
        assert!(!svc.is_running());
        let ctx = devices.device("arc0").unwrap().arc_context().unwrap();
        assert!(!ctx.is_started());
        assert!(!ctx.is_link_up());
        assert!(!ctx.has_ipv6());
        assert_eq!(
            svc.datapath()
                .count(|c| *c == DatapathCall::RemoveDevice("arcbr0".to_string())),
            1
        );

        // Devices removed after stop are not stopped twice
        devices.shutdown(&mut svc);
        assert_eq!(
            svc.datapath()
                .count(|c| matches!(c, DatapathCall::RemoveDevice(_))),
            1
        );
    }

    #[test]
    fn test_vm_devices_use_taps() {
        let mut devices = devices(GuestType::ArcVm);
        let mut svc = service(GuestType::ArcVm);
        svc.on_start(&mut devices);

        let arc0 = devices.device("arc0").unwrap();
        assert!(arc0.is_started());
        assert_eq!(arc0.tap_ifname(), Some("vmtap0"));

        // VM devices take no part in link tracking
        svc.on_link_message(&link("arc0", true), &mut devices);
        assert_eq!(lookups(&svc), 0);

        svc.on_stop(&mut devices);
        let arc0 = devices.device("arc0").unwrap();
        assert_eq!(arc0.tap_ifname(), None);
        assert!(
            svc.datapath()
                .calls()
                .contains(&DatapathCall::RemoveTap("vmtap0".to_string()))
        );
    }

    #[test]
    fn test_default_interface_redoes_ipv6() {
        let mut devices = devices(GuestType::ArcLegacy);
        let mut svc = service(GuestType::ArcLegacy).with_tables();
        svc.on_start(&mut devices);
        svc.on_link_message(&link("arc0", true), &mut devices);
        svc.datapath_mut().take_calls();

        devices.on_default_interface_changed("wlan0", &mut svc);
        assert_eq!(
            svc.datapath().calls(),
            &[
                DatapathCall::TeardownIpv6("arcbr0".to_string()),
                DatapathCall::LookupRoutingTable("arc0".to_string()),
                DatapathCall::SetupIpv6 {
                    host_ifname: "arcbr0".to_string(),
                    table_id: 1000,
                },
            ]
        );

        // Stopped devices are left alone
        svc.on_stop(&mut devices);
        svc.datapath_mut().take_calls();
        devices.on_default_interface_changed("eth0", &mut NullObserver);
        devices.on_default_interface_changed("eth1", &mut svc);
        assert!(svc.datapath().calls().is_empty());
    }

    #[test]
    fn test_repeated_default_interface_message() {
        let mut devices = devices(GuestType::ArcLegacy);
        let mut svc = service(GuestType::ArcLegacy).with_tables();
        svc.on_start(&mut devices);
        svc.on_link_message(&link("arc0", true), &mut devices);

        let msg = GuestMessage::new(GuestType::ArcLegacy, GuestEvent::DefaultInterfaceChanged)
            .with_ifname("wlan0");
        svc.dispatch_message(&msg, &mut devices);
        svc.dispatch_message(&msg, &mut devices);

        assert_eq!(devices.default_interface(), Some("wlan0"));
        assert_eq!(
            svc.datapath()
                .count(|c| *c == DatapathCall::TeardownIpv6("arcbr0".to_string())),
            1
        );
        assert_eq!(
            svc.datapath()
                .count(|c| matches!(c, DatapathCall::SetupIpv6 { .. })),
            2
        );
    }

    impl ArcService<RecordingDatapath> {
        /// Swap in a datapath that always finds a routing table
        fn with_tables(mut self) -> Self {
            self.datapath = RecordingDatapath::new().with_table_base(1000);
            self
        }
    }
}
