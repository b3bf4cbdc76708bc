//! Collaborators above and beside the connection layer

use crate::addr::{BdAddr, LeAddr};
use crate::buf::NetBuf;
use crate::conn::table::ConnRef;
use crate::conn::types::{ConnInfo, LeConnParams, SecurityLevel};
use crate::error::{ConnError, ConnResult};
use crate::hci::data::Boundary;

/// L2CAP or equivalent PDU consumer
#[allow(unused_variables)]
pub trait UpperLayer: Send + Sync {
    /// An ACL link came up, channels may be set up
    fn connected(&self, conn: &ConnRef) {}

    /// An ACL link is gone, channels must be torn down
    fn disconnected(&self, conn: &ConnRef) {}

    /// A complete PDU, basic L2CAP header included
    fn recv(&self, conn: &ConnRef, pdu: NetBuf);

    /// Ask the central for new parameters over the signalling channel
    fn le_param_update_request(&self, conn: &ConnRef, params: &LeConnParams) -> ConnResult<()> {
        Err(ConnError::NotSupported)
    }

    /// Start pairing or a security request when no key is at hand
    fn start_security(&self, conn: &ConnRef, level: SecurityLevel) -> ConnResult<()> {
        Err(ConnError::NotSupported)
    }
}

/// Consumer of isochronous data
#[allow(unused_variables)]
pub trait IsoHandler: Send + Sync {
    fn connected(&self, conn: &ConnRef) {}

    fn disconnected(&self, conn: &ConnRef, reason: u8) {}

    /// One ISO frame payload, header stripped
    fn recv(&self, conn: &ConnRef, boundary: Boundary, payload: &[u8]);
}

/// LE long term key as stored after pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtkInfo {
    pub rand: u64,
    pub ediv: u16,
    pub ltk: [u8; 16],
    /// Key came from an authenticated pairing
    pub authenticated: bool,
    /// Key came from LE Secure Connections
    pub secure_connections: bool,
}

impl LtkInfo {
    /// Level an encrypted link reaches with this key
    pub fn level(&self) -> SecurityLevel {
        match (self.authenticated, self.secure_connections) {
            (true, true) => SecurityLevel::Fips,
            (true, false) => SecurityLevel::High,
            _ => SecurityLevel::Medium,
        }
    }
}

/// Key persistence, owned by the application
#[allow(unused_variables)]
pub trait KeyStore: Send + Sync {
    fn le_ltk(&self, id: u8, peer: &LeAddr) -> Option<LtkInfo>;

    /// Whether the stored BR/EDR link key for `peer` is authenticated,
    /// `None` without a key
    fn br_key_authenticated(&self, peer: &BdAddr) -> Option<bool> {
        None
    }

    /// Security of a link changed
    fn security_changed(&self, info: &ConnInfo, level: SecurityLevel) {}
}
