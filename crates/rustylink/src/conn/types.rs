//! Type definitions for the connection layer

use crate::addr::{BdAddr, LeAddr};
use bitflags::bitflags;
use std::fmt;

/// Kind of link a connection object represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// BR/EDR ACL
    Br,
    /// LE ACL
    Le,
    /// BR/EDR synchronous voice link
    Sco,
    /// LE isochronous link
    Iso,
}

impl ConnType {
    pub fn mask(&self) -> ConnTypeMask {
        match self {
            ConnType::Br => ConnTypeMask::BR,
            ConnType::Le => ConnTypeMask::LE,
            ConnType::Sco => ConnTypeMask::SCO,
            ConnType::Iso => ConnTypeMask::ISO,
        }
    }

    /// Whether this link carries ACL data
    pub fn is_acl(&self) -> bool {
        matches!(self, ConnType::Br | ConnType::Le)
    }
}

bitflags! {
    /// Set of connection types, used to filter bulk operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnTypeMask: u8 {
        const BR = 1 << 0;
        const LE = 1 << 1;
        const SCO = 1 << 2;
        const ISO = 1 << 3;
        const ACL = Self::BR.bits() | Self::LE.bits();
        const ALL = Self::ACL.bits() | Self::SCO.bits() | Self::ISO.bits();
    }
}

/// Local role on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        if value == crate::hci::constants::HCI_ROLE_SLAVE {
            Role::Slave
        } else {
            Role::Master
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Disconnected,
    /// LE: waiting for the peer to show up in a scan
    ConnectScan,
    /// LE: auto-connect through the filter accept list
    ConnectAuto,
    /// LE: undirected connectable advertising
    ConnectAdv,
    /// LE: directed connectable advertising
    ConnectDirAdv,
    /// Link establishment in flight
    Connect,
    Connected,
    /// Teardown requested
    Disconnect,
    /// Controller confirmed teardown
    DisconnectComplete,
}

impl ConnState {
    /// States that precede link establishment
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnState::ConnectScan
                | ConnState::ConnectAuto
                | ConnState::ConnectAdv
                | ConnState::ConnectDirAdv
                | ConnState::Connect
        )
    }

    /// States in which the controller handle is valid
    pub fn has_handle(&self) -> bool {
        matches!(
            self,
            ConnState::Connected | ConnState::Disconnect | ConnState::DisconnectComplete
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::ConnectScan => "connect-scan",
            Self::ConnectAuto => "connect-auto",
            Self::ConnectAdv => "connect-adv",
            Self::ConnectDirAdv => "connect-dir-adv",
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::DisconnectComplete => "disconnect-complete",
        };
        f.write_str(name)
    }
}

/// Link security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No encryption and no authentication
    Low = 1,
    /// Encryption with an unauthenticated key
    Medium = 2,
    /// Encryption with an authenticated key
    High = 3,
    /// Authenticated LE Secure Connections with a 128-bit key
    Fips = 4,
}

/// BR/EDR power mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtMode {
    Active,
    Sniff,
}

bitflags! {
    /// Per-connection flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnFlags: u32 {
        /// Reconnect automatically through scanning
        const AUTO_CONNECT = 1 << 0;
        /// The application asked for new LE parameters before the
        /// peripheral update timer fired
        const PARAM_UPDATE_PENDING = 1 << 1;
        /// Disconnected; queue flush and reference release still to run
        const CLEANUP_PENDING = 1 << 2;
        /// A sender is waiting for a controller packet credit
        const WAIT_PKT_CREDIT = 1 << 3;
        /// Remote features have been read
        const REMOTE_INFO = 1 << 4;
        /// The peripheral update timer has fired
        const PARAM_UPDATE_DONE = 1 << 5;
        /// LE create connection was cancelled because it timed out
        const CONN_TIMEOUT = 1 << 6;
        /// Encryption was requested and is in progress
        const ENCRYPT_PENDING = 1 << 7;
    }
}

/// LE connection parameters, in controller units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnParams {
    /// Minimum connection interval (1.25ms units)
    pub interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub interval_max: u16,
    /// Peripheral latency (number of events)
    pub latency: u16,
    /// Supervision timeout (10ms units)
    pub timeout: u16,
}

impl LeConnParams {
    /// Validates that the parameters are within acceptable ranges
    pub fn validate(&self) -> bool {
        let interval_ok = self.interval_min >= 0x0006
            && self.interval_max <= 0x0C80
            && self.interval_min <= self.interval_max;

        let latency_ok = self.latency <= 0x01F3;

        let timeout_ok = self.timeout >= 0x000A && self.timeout <= 0x0C80;

        // Supervision timeout must exceed (1 + latency) * max interval * 2
        let relation_ok = (self.timeout as u32) * 4
            > (1 + self.latency as u32) * (self.interval_max as u32);

        interval_ok && latency_ok && timeout_ok && relation_ok
    }
}

/// LE data length in use on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLenInfo {
    pub tx_max_len: u16,
    pub tx_max_time: u16,
    pub rx_max_len: u16,
    pub rx_max_time: u16,
}

impl Default for DataLenInfo {
    fn default() -> Self {
        Self {
            tx_max_len: 27,
            tx_max_time: 328,
            rx_max_len: 27,
            rx_max_time: 328,
        }
    }
}

/// LE PHY in use on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyInfo {
    pub tx_phy: u8,
    pub rx_phy: u8,
}

impl Default for PhyInfo {
    fn default() -> Self {
        Self { tx_phy: 1, rx_phy: 1 }
    }
}

/// LE link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeLink {
    /// Peer identity
    pub dst: LeAddr,
    /// Initiator address as seen on air
    pub init_addr: LeAddr,
    /// Responder address as seen on air
    pub resp_addr: LeAddr,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    /// Parameters requested by the application or used for creation
    pub pending_params: LeConnParams,
    pub data_len: DataLenInfo,
    pub phy: PhyInfo,
    pub features: [u8; 8],
}

/// BR/EDR ACL link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrLink {
    pub dst: BdAddr,
    pub mode: BtMode,
    pub sniff_interval: u16,
    pub features: [u8; 8],
    /// Link key reference handed out by the keystore
    pub link_key: Option<u32>,
    pub esco_packet_type: u16,
}

/// SCO link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoLink {
    pub dst: BdAddr,
    pub packet_type: u16,
    pub air_mode: u8,
}

/// ISO link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoLink {
    /// Handle of the LE ACL this stream belongs to
    pub acl_handle: u16,
}

/// Link-type specific state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkParams {
    Br(BrLink),
    Le(LeLink),
    Sco(ScoLink),
    Iso(IsoLink),
}

impl LinkParams {
    pub fn new_br(dst: BdAddr) -> Self {
        LinkParams::Br(BrLink {
            dst,
            mode: BtMode::Active,
            sniff_interval: 0,
            features: [0; 8],
            link_key: None,
            esco_packet_type: 0,
        })
    }

    pub fn new_le(dst: LeAddr, params: LeConnParams) -> Self {
        LinkParams::Le(LeLink {
            dst,
            init_addr: LeAddr::NONE,
            resp_addr: LeAddr::NONE,
            interval: 0,
            latency: 0,
            timeout: 0,
            pending_params: params,
            data_len: DataLenInfo::default(),
            phy: PhyInfo::default(),
            features: [0; 8],
        })
    }

    pub fn new_sco(dst: BdAddr, packet_type: u16) -> Self {
        LinkParams::Sco(ScoLink {
            dst,
            packet_type,
            air_mode: 0,
        })
    }

    pub fn new_iso(acl_handle: u16) -> Self {
        LinkParams::Iso(IsoLink { acl_handle })
    }

    pub fn conn_type(&self) -> ConnType {
        match self {
            LinkParams::Br(_) => ConnType::Br,
            LinkParams::Le(_) => ConnType::Le,
            LinkParams::Sco(_) => ConnType::Sco,
            LinkParams::Iso(_) => ConnType::Iso,
        }
    }
}

/// Snapshot of a connection
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub conn_type: ConnType,
    pub role: Role,
    pub handle: u16,
    pub state: ConnState,
    /// Local identity index
    pub id: u8,
    pub security: SecurityLevel,
    pub link: LinkParams,
}

/// Remote information made available after feature exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub conn_type: ConnType,
    pub features: [u8; 8],
}
