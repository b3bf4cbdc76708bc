//! Typed controller events
//!
//! [`ControllerEvent::parse`] turns a raw [`HciEvent`] into one of the events
//! the connection layer reacts to. Events it has no use for yield `None`.

use crate::addr::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::packet::HciEvent;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// One entry of a Number Of Completed Packets event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedPackets {
    pub handle: u16,
    pub count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub bd_addr: BdAddr,
    pub link_type: u8,
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub bd_addr: BdAddr,
    pub link_type: u8,
    pub air_mode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub role: u8,
    pub peer: LeAddr,
    /// Local resolvable address, enhanced event only
    pub local_rpa: Option<BdAddr>,
    /// Peer resolvable address, enhanced event only
    pub peer_rpa: Option<BdAddr>,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

/// Events consumed by the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    ConnectionComplete(ConnectionComplete),
    ConnectionRequest {
        bd_addr: BdAddr,
        class_of_device: [u8; 3],
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    RemoteFeatures {
        status: u8,
        handle: u16,
        features: [u8; 8],
    },
    RoleChange {
        status: u8,
        bd_addr: BdAddr,
        role: u8,
    },
    NumberOfCompletedPackets(Vec<CompletedPackets>),
    ModeChange {
        status: u8,
        handle: u16,
        mode: u8,
        interval: u16,
    },
    SyncConnectionComplete(SyncConnectionComplete),
    LeConnectionComplete(LeConnectionComplete),
    LeConnectionUpdateComplete {
        status: u8,
        handle: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    },
    LeRemoteFeatures {
        status: u8,
        handle: u16,
        features: [u8; 8],
    },
    LeDataLengthChange {
        handle: u16,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
    LePhyUpdateComplete {
        status: u8,
        handle: u16,
        tx_phy: u8,
        rx_phy: u8,
    },
}

fn read_addr(cursor: &mut Cursor<&[u8]>) -> Option<BdAddr> {
    let mut bytes = [0u8; 6];
    cursor.read_exact(&mut bytes).ok()?;
    Some(BdAddr::new(bytes))
}

fn read_handle(cursor: &mut Cursor<&[u8]>) -> Option<u16> {
    Some(cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK)
}

fn read_features(cursor: &mut Cursor<&[u8]>) -> Option<[u8; 8]> {
    let mut features = [0u8; 8];
    cursor.read_exact(&mut features).ok()?;
    Some(features)
}

impl ControllerEvent {
    /// Parse a controller event the connection layer cares about
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = Cursor::new(event.parameters.as_slice());

        match event.event_code {
            EVT_CONN_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = read_handle(&mut cursor)?;
                let bd_addr = read_addr(&mut cursor)?;
                let link_type = cursor.read_u8().ok()?;
                let encryption_enabled = cursor.read_u8().ok()? != 0;
                Some(Self::ConnectionComplete(ConnectionComplete {
                    status,
                    handle,
                    bd_addr,
                    link_type,
                    encryption_enabled,
                }))
            }

            EVT_CONN_REQUEST => {
                let bd_addr = read_addr(&mut cursor)?;
                let mut class_of_device = [0u8; 3];
                cursor.read_exact(&mut class_of_device).ok()?;
                let link_type = cursor.read_u8().ok()?;
                Some(Self::ConnectionRequest {
                    bd_addr,
                    class_of_device,
                    link_type,
                })
            }

            EVT_DISCONN_COMPLETE => Some(Self::DisconnectionComplete {
                status: cursor.read_u8().ok()?,
                handle: read_handle(&mut cursor)?,
                reason: cursor.read_u8().ok()?,
            }),

            EVT_ENCRYPTION_CHANGE => Some(Self::EncryptionChange {
                status: cursor.read_u8().ok()?,
                handle: read_handle(&mut cursor)?,
                enabled: cursor.read_u8().ok()? != 0,
            }),

            EVT_REMOTE_FEATURES => Some(Self::RemoteFeatures {
                status: cursor.read_u8().ok()?,
                handle: read_handle(&mut cursor)?,
                features: read_features(&mut cursor)?,
            }),

            EVT_ROLE_CHANGE => Some(Self::RoleChange {
                status: cursor.read_u8().ok()?,
                bd_addr: read_addr(&mut cursor)?,
                role: cursor.read_u8().ok()?,
            }),

            EVT_NUM_COMPLETED_PACKETS => {
                let num_handles = cursor.read_u8().ok()?;
                let mut entries = Vec::with_capacity(num_handles as usize);
                for _ in 0..num_handles {
                    let handle = read_handle(&mut cursor)?;
                    let count = cursor.read_u16::<LittleEndian>().ok()?;
                    entries.push(CompletedPackets { handle, count });
                }
                Some(Self::NumberOfCompletedPackets(entries))
            }

            EVT_MODE_CHANGE => Some(Self::ModeChange {
                status: cursor.read_u8().ok()?,
                handle: read_handle(&mut cursor)?,
                mode: cursor.read_u8().ok()?,
                interval: cursor.read_u16::<LittleEndian>().ok()?,
            }),

            EVT_SYNC_CONN_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = read_handle(&mut cursor)?;
                let bd_addr = read_addr(&mut cursor)?;
                let link_type = cursor.read_u8().ok()?;
                // tx interval, retransmission window, rx/tx packet lengths
                let mut skip = [0u8; 6];
                cursor.read_exact(&mut skip).ok()?;
                let air_mode = cursor.read_u8().ok()?;
                Some(Self::SyncConnectionComplete(SyncConnectionComplete {
                    status,
                    handle,
                    bd_addr,
                    link_type,
                    air_mode,
                }))
            }

            EVT_LE_META_EVENT => Self::parse_le_meta(&mut cursor),

            _ => None,
        }
    }

    fn parse_le_meta(cursor: &mut Cursor<&[u8]>) -> Option<Self> {
        let subevent = cursor.read_u8().ok()?;

        match subevent {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENH_CONN_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = read_handle(cursor)?;
                let role = cursor.read_u8().ok()?;
                let addr_type = AddressType::from(cursor.read_u8().ok()?);
                let addr = read_addr(cursor)?;
                let (local_rpa, peer_rpa) = if subevent == EVT_LE_ENH_CONN_COMPLETE {
                    let local = read_addr(cursor)?;
                    let peer = read_addr(cursor)?;
                    let local = (local != BdAddr::ANY).then_some(local);
                    let peer = (peer != BdAddr::ANY).then_some(peer);
                    (local, peer)
                } else {
                    (None, None)
                };
                let interval = cursor.read_u16::<LittleEndian>().ok()?;
                let latency = cursor.read_u16::<LittleEndian>().ok()?;
                let timeout = cursor.read_u16::<LittleEndian>().ok()?;

                Some(Self::LeConnectionComplete(LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer: LeAddr { addr_type, addr },
                    local_rpa,
                    peer_rpa,
                    interval,
                    latency,
                    timeout,
                }))
            }

            EVT_LE_CONN_UPDATE_COMPLETE => Some(Self::LeConnectionUpdateComplete {
                status: cursor.read_u8().ok()?,
                handle: read_handle(cursor)?,
                interval: cursor.read_u16::<LittleEndian>().ok()?,
                latency: cursor.read_u16::<LittleEndian>().ok()?,
                timeout: cursor.read_u16::<LittleEndian>().ok()?,
            }),

            EVT_LE_REMOTE_FEATURES => Some(Self::LeRemoteFeatures {
                status: cursor.read_u8().ok()?,
                handle: read_handle(cursor)?,
                features: read_features(cursor)?,
            }),

            EVT_LE_DATA_LEN_CHANGE => Some(Self::LeDataLengthChange {
                handle: read_handle(cursor)?,
                max_tx_octets: cursor.read_u16::<LittleEndian>().ok()?,
                max_tx_time: cursor.read_u16::<LittleEndian>().ok()?,
                max_rx_octets: cursor.read_u16::<LittleEndian>().ok()?,
                max_rx_time: cursor.read_u16::<LittleEndian>().ok()?,
            }),

            EVT_LE_PHY_UPDATE_COMPLETE => Some(Self::LePhyUpdateComplete {
                status: cursor.read_u8().ok()?,
                handle: read_handle(cursor)?,
                tx_phy: cursor.read_u8().ok()?,
                rx_phy: cursor.read_u8().ok()?,
            }),

            _ => None,
        }
    }
}
