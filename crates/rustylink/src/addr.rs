//! Bluetooth device addresses

use std::fmt;

pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// A 48-bit device address, stored little-endian as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// An LE address together with its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeAddr {
    pub addr_type: AddressType,
    pub addr: BdAddr,
}

impl LeAddr {
    /// Placeholder peer used by undirected connectable advertising
    pub const NONE: LeAddr = LeAddr {
        addr_type: AddressType::Public,
        addr: BdAddr::ANY,
    };

    pub fn public(bytes: [u8; 6]) -> Self {
        Self {
            addr_type: AddressType::Public,
            addr: BdAddr::new(bytes),
        }
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self {
            addr_type: AddressType::Random,
            addr: BdAddr::new(bytes),
        }
    }

    /// Whether this is a resolvable private address
    pub fn is_rpa(&self) -> bool {
        self.addr_type == AddressType::Random && (self.addr.bytes[5] & 0xC0) == 0x40
    }
}

impl fmt::Display for LeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.addr_type {
            AddressType::Public => "public",
            AddressType::Random => "random",
            AddressType::PublicIdentity => "public-id",
            AddressType::RandomIdentity => "random-id",
        };
        write!(f, "{} ({})", self.addr, kind)
    }
}
