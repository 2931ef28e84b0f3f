//! MAC address generation for guest-side interfaces

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

/// Attempts before accepting a duplicate address
const MAX_GENERATE_ATTEMPTS: usize = 16;

/// A 48-bit Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Locally administered bit (0x02 of the first octet)
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Group bit (0x01 of the first octet)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Random generator of locally administered unicast MAC addresses
///
/// Collision avoidance is best effort: addresses issued by this generator
/// are remembered and redrawn a bounded number of times.
#[derive(Debug)]
pub struct MacAddressGenerator {
    rng: StdRng,
    issued: HashSet<MacAddress>,
}

impl MacAddressGenerator {
    /// Generator seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            issued: HashSet::new(),
        }
    }

    /// Deterministic generator for reproducible layouts
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            issued: HashSet::new(),
        }
    }

    pub fn generate(&mut self) -> MacAddress {
        let mut candidate = self.draw();
        for _ in 1..MAX_GENERATE_ATTEMPTS {
            if !self.issued.contains(&candidate) {
                break;
            }
            candidate = self.draw();
        }
        self.issued.insert(candidate);
        candidate
    }

    /// Forget an address so it no longer counts as issued
    pub fn release(&mut self, mac: MacAddress) -> bool {
        self.issued.remove(&mac)
    }

    /// Number of addresses currently issued
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    fn draw(&mut self) -> MacAddress {
        let mut octets = [0u8; 6];
        self.rng.fill_bytes(&mut octets);
        // Clear the group bit, set the locally administered bit
        octets[0] = (octets[0] & 0xfe) | 0x02;
        MacAddress(octets)
    }
}

impl Default for MacAddressGenerator {
    fn default() -> Self {
        Self::new()
    }
}
