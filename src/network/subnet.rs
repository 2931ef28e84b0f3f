//! IPv4 subnet management for guest devices
//!
//! Provides:
//! - A fixed, class-partitioned inventory of subnets
//! - FIFO allocation and release of whole subnets
//! - Per-subnet address allocation by offset
//! - Locally administered MAC address generation

use crate::error::{Error, Result};
use crate::manifest::{SubnetClassConfig, SubnetsConfig};
use crate::network::mac::{MacAddress, MacAddressGenerator};
use ipnet::Ipv4Net;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Class of subnets a device draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubnetClass {
    /// Reserved for the primary Android device
    Android,
    /// Shared by every other host interface
    Peripheral,
    /// Secondary subnets for containers nested in the guest
    Container,
}

impl fmt::Display for SubnetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetClass::Android => write!(f, "android"),
            SubnetClass::Peripheral => write!(f, "peripheral"),
            SubnetClass::Container => write!(f, "container"),
        }
    }
}

/// A single address carved out of a [`Subnet`]
///
/// Not `Clone`: the holder owns the address until it is handed back
/// with [`Subnet::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubnetAddress {
    addr: Ipv4Addr,
    prefix_len: u8,
    offset: u32,
}

impl SubnetAddress {
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Offset from the first usable address of the subnet
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl fmt::Display for SubnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// A contiguous IPv4 block owned by the pool until released
#[derive(Debug)]
pub struct Subnet {
    class: SubnetClass,
    index: u32,
    net: Ipv4Net,
    /// Number of usable host addresses
    usable: u32,
    /// Offsets handed out and not yet released
    in_use: BTreeSet<u32>,
}

impl Subnet {
    fn new(class: SubnetClass, index: u32, net: Ipv4Net) -> Self {
        // Network and broadcast addresses are not usable
        let size = 1u64 << (32 - u32::from(net.prefix_len()));
        let usable = u32::try_from(size.saturating_sub(2)).unwrap_or(u32::MAX);
        Self {
            class,
            index,
            net,
            usable,
            in_use: BTreeSet::new(),
        }
    }

    pub fn class(&self) -> SubnetClass {
        self.class
    }

    /// Position of this subnet inside its class
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    pub fn base_address(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    /// Number of usable host addresses
    pub fn address_count(&self) -> usize {
        self.usable as usize
    }

    /// Number of host addresses not handed out yet
    pub fn available_count(&self) -> usize {
        (self.usable as usize).saturating_sub(self.in_use.len())
    }

    /// Address at `offset` from the first usable host, if inside the subnet
    pub fn address_at_offset(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset >= self.usable {
            return None;
        }
        let base = u32::from(self.net.network());
        Some(Ipv4Addr::from(base + 1 + offset))
    }

    /// Allocate the address at a specific offset
    pub fn allocate_at_offset(&mut self, offset: u32) -> Option<SubnetAddress> {
        let addr = self.address_at_offset(offset)?;
        if !self.in_use.insert(offset) {
            return None;
        }

        Some(SubnetAddress {
            addr,
            prefix_len: self.net.prefix_len(),
            offset,
        })
    }

    /// Allocate the first free address
    pub fn allocate(&mut self) -> Option<SubnetAddress> {
        let offset = (0..self.usable).find(|offset| !self.in_use.contains(offset))?;
        self.allocate_at_offset(offset)
    }

    /// Return an address to this subnet
    pub fn release(&mut self, address: SubnetAddress) {
        if address.prefix_len != self.net.prefix_len() || !self.net.contains(&address.addr) {
            warn!(%address, subnet = %self.net, "Releasing address into a foreign subnet");
            return;
        }
        self.in_use.remove(&address.offset);
    }
}

/// Free list for one subnet class
#[derive(Debug)]
struct ClassPool {
    class: SubnetClass,
    config: SubnetClassConfig,
    free: VecDeque<u32>,
}

impl ClassPool {
    fn new(class: SubnetClass, config: &SubnetClassConfig) -> Self {
        Self {
            class,
            config: config.clone(),
            free: (0..config.count).collect(),
        }
    }

    fn subnet_at(&self, index: u32) -> Result<Subnet> {
        let base = u64::from(u32::from(self.config.base)) + u64::from(index) * self.config.subnet_size();
        let base = u32::try_from(base).map_err(|_| {
            Error::Network(format!("Subnet {} of class {} is out of range", index, self.class))
        })?;
        let net = Ipv4Net::new(Ipv4Addr::from(base), self.config.prefix_len)
            .map_err(|e| Error::Network(format!("Invalid prefix for class {}: {}", self.class, e)))?;
        Ok(Subnet::new(self.class, index, net))
    }
}

/// Fixed inventory of preallocated IPv4 subnets
#[derive(Debug)]
pub struct SubnetPool {
    android: ClassPool,
    peripheral: ClassPool,
    container: ClassPool,
    macs: MacAddressGenerator,
}

impl SubnetPool {
    /// Create a pool from the configured class layout
    pub fn new(config: &SubnetsConfig) -> Self {
        Self::with_mac_generator(config, MacAddressGenerator::new())
    }

    /// Create a pool with an injected MAC address generator
    pub fn with_mac_generator(config: &SubnetsConfig, macs: MacAddressGenerator) -> Self {
        Self {
            android: ClassPool::new(SubnetClass::Android, &config.android),
            peripheral: ClassPool::new(SubnetClass::Peripheral, &config.peripheral),
            container: ClassPool::new(SubnetClass::Container, &config.container),
            macs,
        }
    }

    fn class_mut(&mut self, class: SubnetClass) -> &mut ClassPool {
        match class {
            SubnetClass::Android => &mut self.android,
            SubnetClass::Peripheral => &mut self.peripheral,
            SubnetClass::Container => &mut self.container,
        }
    }

    /// Allocate the next free subnet of a class
    ///
    /// Returns `None` when the class is exhausted.
    pub fn allocate_subnet(&mut self, class: SubnetClass) -> Option<Subnet> {
        let pool = self.class_mut(class);
        let index = pool.free.pop_front()?;
        match pool.subnet_at(index) {
            Ok(subnet) => {
                debug!(%class, subnet = %subnet.network(), "Allocated subnet");
                Some(subnet)
            }
            Err(e) => {
                // Keep the slot so a later release does not duplicate it
                pool.free.push_front(index);
                warn!(%class, "Cannot build subnet {}: {}", index, e);
                None
            }
        }
    }

    /// First and second usable addresses of a subnet (host, guest)
    pub fn allocate_address_pair(subnet: &mut Subnet) -> Option<(SubnetAddress, SubnetAddress)> {
        let host = subnet.allocate_at_offset(0)?;
        match subnet.allocate_at_offset(1) {
            Some(guest) => Some((host, guest)),
            None => {
                subnet.release(host);
                None
            }
        }
    }

    /// Return a subnet to the free list of its class
    pub fn release(&mut self, subnet: Subnet) {
        let class = subnet.class;
        let pool = self.class_mut(class);
        if subnet.index >= pool.config.count || pool.free.contains(&subnet.index) {
            warn!(%class, subnet = %subnet.net, "Ignoring release of a subnet that is not allocated");
            return;
        }
        debug!(%class, subnet = %subnet.net, "Released subnet");
        pool.free.push_back(subnet.index);
    }

    /// Number of free subnets left in a class
    pub fn available(&self, class: SubnetClass) -> usize {
        match class {
            SubnetClass::Android => self.android.free.len(),
            SubnetClass::Peripheral => self.peripheral.free.len(),
            SubnetClass::Container => self.container.free.len(),
        }
    }

    /// Generate a locally administered unicast MAC address
    pub fn generate_mac_address(&mut self) -> MacAddress {
        self.macs.generate()
    }

    /// Return a MAC address of a destroyed device
    pub fn release_mac_address(&mut self, mac: MacAddress) {
        if !self.macs.release(mac) {
            debug!(%mac, "Released MAC address was not issued");
        }
    }

    /// Number of MAC addresses held by live devices
    pub fn issued_mac_count(&self) -> usize {
        self.macs.issued_count()
    }
}
