//! Network primitives for guest devices
//!
//! Provides:
//! - IPv4 subnet pool and per-subnet address allocation
//! - MAC address generation
//! - RTNL link notification decoding

pub mod mac;
pub mod netlink;
pub mod subnet;

pub use mac::{MacAddress, MacAddressGenerator};
pub use netlink::{LinkMessage, LinkMessageKind, parse_link_messages};
pub use subnet::{Subnet, SubnetAddress, SubnetClass, SubnetPool};
