//! HCI data packet headers
//!
//! ACL, ISO and SCO frames share the same layout: a 12-bit connection handle
//! with flag bits packed into its upper nibble, followed by a length field.

use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Position of a link-layer frame relative to the PDU it carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// First fragment of a PDU that spans several frames
    Start,
    /// Middle fragment
    Continue,
    /// Last fragment
    End,
    /// The whole PDU in one frame
    Single,
}

/// ACL data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    pub handle: u16,
    /// Raw packet boundary flag (2 bits)
    pub pb_flag: u8,
    /// Raw broadcast flag (2 bits)
    pub bc_flag: u8,
    pub length: u16,
}

impl AclHeader {
    pub fn new(handle: u16, pb_flag: u8, length: u16) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            pb_flag: pb_flag & 0x03,
            bc_flag: ACL_BC_POINT_TO_POINT,
            length,
        }
    }

    /// Header for an outbound frame
    ///
    /// ACL has no distinct end flag, so [`Boundary::End`] goes out as a
    /// continuation. `flushable` selects the start flag used on BR/EDR links.
    pub fn outbound(handle: u16, boundary: Boundary, flushable: bool, length: u16) -> Self {
        let pb_flag = match boundary {
            Boundary::Start | Boundary::Single if flushable => ACL_PB_START,
            Boundary::Start | Boundary::Single => ACL_PB_START_NO_FLUSH,
            Boundary::Continue | Boundary::End => ACL_PB_CONT,
        };
        Self::new(handle, pb_flag, length)
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_ACL_HDR_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let handle_flags = cursor.read_u16::<LittleEndian>().ok()?;
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            handle: handle_flags & HCI_HANDLE_MASK,
            pb_flag: ((handle_flags >> 12) & 0x03) as u8,
            bc_flag: ((handle_flags >> 14) & 0x03) as u8,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; HCI_ACL_HDR_SIZE] {
        let handle_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.pb_flag as u16 & 0x03) << 12)
            | ((self.bc_flag as u16 & 0x03) << 14);
        let mut out = [0u8; HCI_ACL_HDR_SIZE];
        out[..2].copy_from_slice(&handle_flags.to_le_bytes());
        out[2..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Whether this frame starts a new PDU
    pub fn is_start(&self) -> bool {
        self.pb_flag != ACL_PB_CONT
    }
}

/// ISO data packet header (timestamp and sequence fields are not modelled)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoHeader {
    pub handle: u16,
    pub boundary: Boundary,
    pub length: u16,
}

impl IsoHeader {
    pub fn new(handle: u16, boundary: Boundary, length: u16) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            boundary,
            length: length & 0x3FFF,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_ISO_HDR_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let handle_flags = cursor.read_u16::<LittleEndian>().ok()?;
        let length = cursor.read_u16::<LittleEndian>().ok()? & 0x3FFF;
        let boundary = match ((handle_flags >> 12) & 0x03) as u8 {
            ISO_PB_START => Boundary::Start,
            ISO_PB_CONT => Boundary::Continue,
            ISO_PB_SINGLE => Boundary::Single,
            _ => Boundary::End,
        };

        Some(Self {
            handle: handle_flags & HCI_HANDLE_MASK,
            boundary,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; HCI_ISO_HDR_SIZE] {
        let pb = match self.boundary {
            Boundary::Start => ISO_PB_START,
            Boundary::Continue => ISO_PB_CONT,
            Boundary::Single => ISO_PB_SINGLE,
            Boundary::End => ISO_PB_END,
        };
        let handle_flags = (self.handle & HCI_HANDLE_MASK) | ((pb as u16) << 12);
        let mut out = [0u8; HCI_ISO_HDR_SIZE];
        out[..2].copy_from_slice(&handle_flags.to_le_bytes());
        out[2..].copy_from_slice(&(self.length & 0x3FFF).to_le_bytes());
        out
    }
}

/// SCO data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoHeader {
    pub handle: u16,
    /// Packet status flag (2 bits)
    pub status: u8,
    pub length: u8,
}

impl ScoHeader {
    pub fn new(handle: u16, length: u8) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            status: 0,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_SCO_HDR_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let handle_flags = cursor.read_u16::<LittleEndian>().ok()?;
        let length = cursor.read_u8().ok()?;

        Some(Self {
            handle: handle_flags & HCI_HANDLE_MASK,
            status: ((handle_flags >> 12) & 0x03) as u8,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; HCI_SCO_HDR_SIZE] {
        let handle_flags = (self.handle & HCI_HANDLE_MASK) | ((self.status as u16 & 0x03) << 12);
        let bytes = handle_flags.to_le_bytes();
        [bytes[0], bytes[1], self.length]
    }
}

/// Basic L2CAP header carried at the front of every reassembled ACL PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_HDR_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_HDR_SIZE] {
        let mut out = [0u8; L2CAP_HDR_SIZE];
        out[..2].copy_from_slice(&self.length.to_le_bytes());
        out[2..].copy_from_slice(&self.channel_id.to_le_bytes());
        out
    }

    /// Total PDU size including this header
    pub fn pdu_len(&self) -> usize {
        L2CAP_HDR_SIZE + self.length as usize
    }
}
