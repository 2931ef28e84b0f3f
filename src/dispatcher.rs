//! Single-threaded event dispatcher
//!
//! The dispatcher owns the device manager and every guest service. Host
//! interface changes, netlink datagrams, guest lifecycle messages and
//! retry timers all arrive as [`Event`]s on one channel and are handled
//! strictly in arrival order, so no state is ever shared across threads.
//!
//! The loop ends on [`Event::Shutdown`] or once every [`DispatcherHandle`]
//! is dropped. Either way all devices are torn down.

use crate::device::{Device, DeviceManager, DeviceObserver, DeviceSummary};
use crate::error::{Error, Result};
use crate::guest::{GuestEvent, GuestMessage, GuestService, GuestType, ScheduledRetry};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Events processed by the dispatcher
#[derive(Debug)]
pub enum Event {
    /// Current host interface list, in enumeration order
    InterfaceListChanged(Vec<String>),
    /// New host default interface
    DefaultInterfaceChanged(String),
    /// Raw netlink datagram from a guest's network namespace
    LinkMessage { guest_type: GuestType, bytes: Vec<u8> },
    /// Guest lifecycle message
    Guest(GuestMessage),
    /// A scheduled IPv6 retry fired
    Ipv6Retry {
        guest_type: GuestType,
        ifname: String,
        token: u64,
    },
    /// Request the current device table
    Snapshot(oneshot::Sender<Vec<DeviceSummary>>),
    /// Tear down every device and stop
    Shutdown,
}

/// Guest services, notified together of device changes
struct Services(Vec<Box<dyn GuestService>>);

impl Services {
    fn serving(
        &mut self,
        guest_type: GuestType,
    ) -> impl Iterator<Item = &mut Box<dyn GuestService>> {
        self.0
            .iter_mut()
            .filter(move |s| s.guest_type() == guest_type)
    }
}

impl DeviceObserver for Services {
    fn on_device_added(&mut self, device: &mut Device) {
        for service in &mut self.0 {
            service.on_device_added(device);
        }
    }

    fn on_device_removed(&mut self, device: &mut Device) {
        for service in &mut self.0 {
            service.on_device_removed(device);
        }
    }

    fn on_default_interface_changed(&mut self, device: &mut Device, ifname: &str) {
        for service in &mut self.0 {
            service.on_default_interface_changed(device, ifname);
        }
    }
}

/// The event loop
pub struct Dispatcher {
    /// Channel to receive events
    rx: mpsc::Receiver<Event>,
    /// Sender for retry timers, does not keep the channel open
    tx: mpsc::WeakSender<Event>,
    devices: DeviceManager,
    services: Services,
    /// Retries waiting to be armed
    timers: Vec<ScheduledRetry>,
}

impl Dispatcher {
    /// Create a dispatcher owning `devices`, with the first handle into it
    pub fn new(devices: DeviceManager) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(100);
        let dispatcher = Self {
            rx,
            tx: tx.downgrade(),
            devices,
            services: Services(Vec::new()),
            timers: Vec::new(),
        };
        (dispatcher, DispatcherHandle { tx })
    }

    /// Register a guest service
    pub fn add_service(&mut self, service: Box<dyn GuestService>) {
        debug!(guest = %service.guest_type(), "Registered guest service");
        self.services.0.push(service);
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    /// Process one event
    ///
    /// Returns false once the dispatcher has shut down.
    pub fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::InterfaceListChanged(ifnames) => {
                debug!(count = ifnames.len(), "Host interface list changed");
                self.devices
                    .on_interface_list_changed(&ifnames, &mut self.services);
            }
            Event::DefaultInterfaceChanged(ifname) => {
                self.devices
                    .on_default_interface_changed(&ifname, &mut self.services);
            }
            Event::LinkMessage { guest_type, bytes } => {
                for service in self.services.serving(guest_type) {
                    service.on_link_message(&bytes, &mut self.devices);
                }
            }
            Event::Guest(msg) => {
                if msg.event == GuestEvent::Start {
                    self.devices
                        .on_guest_start(msg.guest_type, &mut self.services);
                }
                for service in &mut self.services.0 {
                    service.dispatch_message(&msg, &mut self.devices);
                }
            }
            Event::Ipv6Retry {
                guest_type,
                ifname,
                token,
            } => {
                for service in self.services.serving(guest_type) {
                    service.on_ipv6_retry(&ifname, token, &mut self.devices);
                }
            }
            Event::Snapshot(reply) => {
                // The requester may have gone away
                let _ = reply.send(self.devices.summaries());
            }
            Event::Shutdown => {
                info!("Dispatcher shutting down");
                self.devices.shutdown(&mut self.services);
                self.timers.clear();
                return false;
            }
        }

        for service in &mut self.services.0 {
            self.timers.extend(service.take_scheduled());
        }
        true
    }

    /// Retries requested since the last call
    pub fn take_timers(&mut self) -> Vec<ScheduledRetry> {
        std::mem::take(&mut self.timers)
    }

    /// Run the event loop until shutdown
    ///
    /// Scheduled retries become tokio timers that feed an
    /// [`Event::Ipv6Retry`] back into the loop.
    pub async fn run(mut self) -> DeviceManager {
        info!("Dispatcher started");

        let mut running = true;
        while running {
            let Some(event) = self.rx.recv().await else {
                info!("All dispatcher handles dropped");
                self.dispatch(Event::Shutdown);
                break;
            };
            running = self.dispatch(event);
            for retry in self.take_timers() {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(retry.delay).await;
                    // Dropped if the dispatcher is gone
                    let Some(tx) = tx.upgrade() else {
                        return;
                    };
                    let _ = tx
                        .send(Event::Ipv6Retry {
                            guest_type: retry.guest_type,
                            ifname: retry.ifname,
                            token: retry.token,
                        })
                        .await;
                });
            }
        }

        info!("Dispatcher stopped");
        self.devices
    }
}

/// Cloneable sender into a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Event>,
}

impl DispatcherHandle {
    pub async fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::ChannelClosed)
    }

    /// Send from outside the runtime
    pub fn blocking_send(&self, event: Event) -> Result<()> {
        self.tx.blocking_send(event).map_err(|_| Error::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<DeviceSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Snapshot(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Snapshot from outside the runtime
    pub fn blocking_snapshot(&self) -> Result<Vec<DeviceSummary>> {
        let (tx, rx) = oneshot::channel();
        self.blocking_send(Event::Snapshot(tx))?;
        rx.blocking_recv().map_err(|_| Error::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::RecordingDatapath;
    use crate::guest::ArcService;
    use crate::manifest::{GuestnetConfig, RetryConfig};
    use crate::network::SubnetClass;
    use crate::network::netlink::{IFF_UP, LinkMessage, LinkMessageKind};
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_attempts: 4,
            jitter_factor: 0.0,
        }
    }

    fn dispatcher(datapath: RecordingDatapath) -> (Dispatcher, DispatcherHandle) {
        let config = GuestnetConfig::default();
        let (mut dispatcher, handle) = Dispatcher::new(DeviceManager::from_config(&config));
        dispatcher.add_service(Box::new(ArcService::new(GuestType::Arc, datapath, &retry())));
        (dispatcher, handle)
    }

    fn link_up(ifname: &str) -> Event {
        Event::LinkMessage {
            guest_type: GuestType::Arc,
            bytes: LinkMessage::new(LinkMessageKind::New, 3, ifname, IFF_UP).encode(),
        }
    }

    fn interfaces(names: &[&str]) -> Event {
        Event::InterfaceListChanged(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_events_drive_devices() {
        let (mut d, _) = dispatcher(RecordingDatapath::new().with_table_base(1000));

        assert!(d.dispatch(interfaces(&["eth0", "wlan0"])));
        assert!(d.devices().exists("eth0"));
        assert!(!d.devices().device("eth0").unwrap().is_started());

        d.dispatch(Event::Guest(GuestMessage::start(GuestType::Arc)));
        assert!(d.devices().devices().all(Device::is_started));

        d.dispatch(link_up("eth0"));
        let ctx = d.devices().device("eth0").unwrap().arc_context().unwrap();
        assert!(ctx.has_ipv6());
        assert!(d.take_timers().is_empty());
    }

    #[test]
    fn test_other_guest_messages_ignored() {
        let (mut d, _) = dispatcher(RecordingDatapath::new());
        d.dispatch(Event::Guest(GuestMessage::start(GuestType::TerminaVm)));
        assert!(!d.devices().device("arc0").unwrap().is_started());

        d.dispatch(Event::LinkMessage {
            guest_type: GuestType::PluginVm,
            bytes: LinkMessage::new(LinkMessageKind::New, 3, "arc0", IFF_UP).encode(),
        });
        assert!(!d.devices().device("arc0").unwrap().arc_context().unwrap().is_link_up());
    }

    #[test]
    fn test_retry_scheduling() {
        let (mut d, _) = dispatcher(RecordingDatapath::new());
        d.dispatch(Event::Guest(GuestMessage::start(GuestType::Arc)));
        d.dispatch(link_up("arc0"));

        let timers = d.take_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].ifname, "arc0");

        // Firing the timer without a table schedules the next one
        let retry = &timers[0];
        d.dispatch(Event::Ipv6Retry {
            guest_type: retry.guest_type,
            ifname: retry.ifname.clone(),
            token: retry.token,
        });
        let next = d.take_timers();
        assert_eq!(next.len(), 1);
        assert_ne!(next[0].token, retry.token);
    }

    #[test]
    fn test_device_removed_message() {
        let (mut d, _) = dispatcher(RecordingDatapath::new());
        d.dispatch(interfaces(&["eth0"]));
        d.dispatch(Event::Guest(GuestMessage::start(GuestType::Arc)));

        let removed = GuestMessage::new(GuestType::Arc, GuestEvent::DeviceRemoved).with_ifname("eth0");
        d.dispatch(Event::Guest(removed));
        assert!(!d.devices().device("eth0").unwrap().is_started());

        let added = GuestMessage::new(GuestType::Arc, GuestEvent::DeviceAdded).with_ifname("eth0");
        d.dispatch(Event::Guest(added));
        assert!(d.devices().device("eth0").unwrap().is_started());
    }

    #[test]
    fn test_shutdown_releases_devices() {
        let (mut d, _) = dispatcher(RecordingDatapath::new());
        d.dispatch(interfaces(&["eth0"]));
        assert!(!d.dispatch(Event::Shutdown));
        assert!(d.devices().is_empty());
        assert_eq!(d.devices().pool().available(SubnetClass::Peripheral), 4);
    }

    #[tokio::test]
    async fn test_run_loop() {
        let (d, handle) = dispatcher(RecordingDatapath::new());
        let late = handle.clone();

        let client = async move {
            handle.send(interfaces(&["eth0", "eth1"])).await.unwrap();
            handle
                .send(Event::Guest(GuestMessage::start(GuestType::Arc)))
                .await
                .unwrap();

            let rows = handle.snapshot().await.unwrap();
            handle.shutdown().await.unwrap();
            rows
        };
        let (devices, rows) = tokio::join!(d.run(), client);

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.started));
        assert_eq!(rows[1].host_addr, "100.115.92.9/30");
        assert_eq!(rows[2].host_addr, "100.115.92.13/30");
        assert!(devices.is_empty());
        assert!(late.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_retry_timers_fire() {
        let (d, handle) = dispatcher(RecordingDatapath::new());

        let client = async move {
            handle
                .send(Event::Guest(GuestMessage::start(GuestType::Arc)))
                .await
                .unwrap();
            handle.send(link_up("arc0")).await.unwrap();

            // Every attempt fails, so the retries run out on their own
            tokio::time::sleep(Duration::from_millis(300)).await;
            let rows = handle.snapshot().await.unwrap();
            handle.shutdown().await.unwrap();
            rows
        };
        let (_, rows) = tokio::join!(d.run(), client);

        assert!(rows[0].routing_table_attempts >= 2);
        assert_eq!(rows[0].ipv6_table, None);
    }

    #[tokio::test]
    async fn test_run_ends_when_handles_dropped() {
        let (d, handle) = dispatcher(RecordingDatapath::new());

        let client = async move {
            handle
                .send(Event::Guest(GuestMessage::start(GuestType::Arc)))
                .await
                .unwrap();
            // A pending retry timer does not keep the loop alive
            handle.send(link_up("arc0")).await.unwrap();
            handle.send(interfaces(&["eth0"])).await.unwrap();
        };
        let (devices, ()) = tokio::join!(d.run(), client);

        assert!(devices.is_empty());
        assert_eq!(devices.pool().available(SubnetClass::Peripheral), 4);
    }
}
