//! guestnet - guest network device lifecycle manager
//!
//! Tracks the host interfaces that are bridged into a guest, allocates
//! their subnets and MAC addresses, and drives per-device start/stop and
//! IPv6 forwarding from guest and host events.

pub mod datapath;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod guest;
pub mod manifest;
pub mod network;
pub mod script;
