//! Transport seam between the connection layer and the controller driver

use crate::error::HciError;
use crate::hci::constants::*;
use crate::hci::packet::{HciCommand, HciEvent};

/// Type tag of an outbound data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Acl,
    Sco,
    Iso,
}

impl PacketKind {
    /// H4 packet indicator for this kind of frame
    pub fn indicator(&self) -> u8 {
        match self {
            PacketKind::Acl => HCI_ACL_PKT,
            PacketKind::Sco => HCI_SCO_PKT,
            PacketKind::Iso => HCI_ISO_PKT,
        }
    }
}

/// A packet read from the controller
#[derive(Debug, Clone)]
pub enum HciPacket {
    Event(HciEvent),
    /// ACL frame including its 4-byte header
    Acl(Vec<u8>),
    /// SCO frame including its 3-byte header
    Sco(Vec<u8>),
    /// ISO frame including its 4-byte header
    Iso(Vec<u8>),
}

/// Driver below the connection layer
///
/// Both calls are synchronous: an `Err` means the controller never got the
/// packet. Command completion arrives later through the event feed.
pub trait Transport: Send + Sync {
    /// Send an HCI command
    fn send_command(&self, command: &HciCommand) -> Result<(), HciError>;

    /// Send one fully framed data packet (transport header included)
    fn send_data(&self, kind: PacketKind, frame: &[u8]) -> Result<(), HciError>;
}
