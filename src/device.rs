//! Guest network devices
//!
//! A device is one virtual link between a host interface and the guest.
//! The [`DeviceManager`] owns every live device and the subnet pool
//! their addresses come from.

pub mod context;
pub mod manager;
pub mod types;

pub use context::{ArcContext, Context, INVALID_TABLE_ID, VmContext};
pub use manager::{DeviceManager, DeviceObserver, DeviceSummary, NullObserver};
pub use types::{Config, Device, DeviceKind, Options};
