//! HCI command and event packets
//!
//! Only the commands the connection layer issues are modelled here. Anything
//! else can be sent through [`HciCommand::Raw`].

use crate::addr::{BdAddr, LeAddr};
use crate::hci::constants::*;

/// HCI commands issued by the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    CreateConnection {
        bd_addr: BdAddr,
        packet_type: u16,
        page_scan_rep_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    CreateConnectionCancel { bd_addr: BdAddr },
    Disconnect { handle: u16, reason: u8 },
    AcceptConnectionRequest { bd_addr: BdAddr, role: u8 },
    RejectConnectionRequest { bd_addr: BdAddr, reason: u8 },
    AuthenticationRequested { handle: u16 },
    ReadRemoteFeatures { handle: u16 },
    SetupSyncConnection {
        handle: u16,
        tx_bandwidth: u32,
        rx_bandwidth: u32,
        max_latency: u16,
        voice_setting: u16,
        retrans_effort: u8,
        packet_type: u16,
    },

    // Link Policy Commands (OGF: 0x02)
    SniffMode {
        handle: u16,
        max_interval: u16,
        min_interval: u16,
        attempt: u16,
        timeout: u16,
    },
    ExitSniffMode { handle: u16 },

    // LE Commands (OGF: 0x08)
    LeSetAdvertiseEnable { enable: bool },
    LeCreateConnection {
        scan_interval: u16,
        scan_window: u16,
        filter_policy: u8,
        peer: LeAddr,
        own_address_type: u8,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    LeCreateConnectionCancel,
    LeConnectionUpdate {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    LeReadRemoteFeatures { handle: u16 },
    LeStartEncryption {
        handle: u16,
        rand: u64,
        ediv: u16,
        ltk: [u8; 16],
    },
    LeSetDataLength {
        handle: u16,
        tx_octets: u16,
        tx_time: u16,
    },
    LeSetPhy {
        handle: u16,
        all_phys: u8,
        tx_phys: u8,
        rx_phys: u8,
        phy_options: u16,
    },

    /// Any other command, given as raw parameters
    Raw { ogf: u8, ocf: u16, params: Vec<u8> },
}

impl HciCommand {
    /// Build a raw command from its OGF, OCF and parameter bytes
    pub fn new(ogf: u8, ocf: u16, params: Vec<u8>) -> Self {
        Self::Raw { ogf, ocf, params }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONN_REQ),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONN_REQ),
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTH_REQUESTED),
            Self::ReadRemoteFeatures { .. } => (OGF_LINK_CTL, OCF_READ_REMOTE_FEATURES),
            Self::SetupSyncConnection { .. } => (OGF_LINK_CTL, OCF_SETUP_SYNC_CONN),

            Self::SniffMode { .. } => (OGF_LINK_POLICY, OCF_SNIFF_MODE),
            Self::ExitSniffMode { .. } => (OGF_LINK_POLICY, OCF_EXIT_SNIFF_MODE),

            Self::LeSetAdvertiseEnable { .. } => (OGF_LE, OCF_LE_SET_ADVERTISE_ENABLE),
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONN_UPDATE),
            Self::LeReadRemoteFeatures { .. } => (OGF_LE, OCF_LE_READ_REMOTE_FEATURES),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPTION),
            Self::LeSetDataLength { .. } => (OGF_LE, OCF_LE_SET_DATA_LEN),
            Self::LeSetPhy { .. } => (OGF_LE, OCF_LE_SET_PHY),

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// Full 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::CreateConnection {
                bd_addr,
                packet_type,
                page_scan_rep_mode,
                clock_offset,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(*page_scan_rep_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(*allow_role_switch as u8);
                params
            }

            Self::CreateConnectionCancel { bd_addr } => bd_addr.as_slice().to_vec(),

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::AcceptConnectionRequest { bd_addr, role } => {
                let mut params = bd_addr.as_slice().to_vec();
                params.push(*role);
                params
            }

            Self::RejectConnectionRequest { bd_addr, reason } => {
                let mut params = bd_addr.as_slice().to_vec();
                params.push(*reason);
                params
            }

            Self::AuthenticationRequested { handle }
            | Self::ReadRemoteFeatures { handle }
            | Self::ExitSniffMode { handle }
            | Self::LeReadRemoteFeatures { handle } => handle.to_le_bytes().to_vec(),

            Self::SetupSyncConnection {
                handle,
                tx_bandwidth,
                rx_bandwidth,
                max_latency,
                voice_setting,
                retrans_effort,
                packet_type,
            } => {
                let mut params = Vec::with_capacity(17);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&tx_bandwidth.to_le_bytes());
                params.extend_from_slice(&rx_bandwidth.to_le_bytes());
                params.extend_from_slice(&max_latency.to_le_bytes());
                params.extend_from_slice(&voice_setting.to_le_bytes());
                params.push(*retrans_effort);
                params.extend_from_slice(&packet_type.to_le_bytes());
                params
            }

            Self::SniffMode {
                handle,
                max_interval,
                min_interval,
                attempt,
                timeout,
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&max_interval.to_le_bytes());
                params.extend_from_slice(&min_interval.to_le_bytes());
                params.extend_from_slice(&attempt.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params
            }

            Self::LeSetAdvertiseEnable { enable } => vec![*enable as u8],

            Self::LeCreateConnection {
                scan_interval,
                scan_window,
                filter_policy,
                peer,
                own_address_type,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => {
                let mut params = Vec::with_capacity(25);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*filter_policy);
                params.push(peer.addr_type.into());
                params.extend_from_slice(peer.addr.as_slice());
                params.push(*own_address_type);
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.extend_from_slice(&latency.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params.extend_from_slice(&0u16.to_le_bytes()); // min CE length
                params.extend_from_slice(&0u16.to_le_bytes()); // max CE length
                params
            }

            Self::LeCreateConnectionCancel => vec![],

            Self::LeConnectionUpdate {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => {
                let mut params = Vec::with_capacity(14);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.extend_from_slice(&latency.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params.extend_from_slice(&0u16.to_le_bytes());
                params.extend_from_slice(&0u16.to_le_bytes());
                params
            }

            Self::LeStartEncryption {
                handle,
                rand,
                ediv,
                ltk,
            } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&rand.to_le_bytes());
                params.extend_from_slice(&ediv.to_le_bytes());
                params.extend_from_slice(ltk);
                params
            }

            Self::LeSetDataLength {
                handle,
                tx_octets,
                tx_time,
            } => {
                let mut params = Vec::with_capacity(6);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&tx_octets.to_le_bytes());
                params.extend_from_slice(&tx_time.to_le_bytes());
                params
            }

            Self::LeSetPhy {
                handle,
                all_phys,
                tx_phys,
                rx_phys,
                phy_options,
            } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*all_phys);
                params.push(*tx_phys);
                params.push(*rx_phys);
                params.extend_from_slice(&phy_options.to_le_bytes());
                params
            }

            Self::Raw { params, .. } => params.clone(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len().min(HCI_MAX_PARAM_LEN) as u8);
        packet.extend_from_slice(&params[..params.len().min(HCI_MAX_PARAM_LEN)]);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Whether this is a Command Complete event for the given command
    pub fn is_command_complete(&self, ogf: u8, ocf: u16) -> bool {
        if self.event_code != EVT_CMD_COMPLETE || self.parameters.len() < 3 {
            return false;
        }
        let opcode = u16::from_le_bytes([self.parameters[1], self.parameters[2]]);
        opcode == (((ogf as u16) << 10) | (ocf & 0x3ff))
    }

    /// Status byte of a Command Complete or Command Status event
    pub fn get_status(&self) -> u8 {
        match self.event_code {
            EVT_CMD_COMPLETE => self.parameters.get(3).copied().unwrap_or(HCI_ERR_UNSPECIFIED),
            EVT_CMD_STATUS => self.parameters.first().copied().unwrap_or(HCI_ERR_UNSPECIFIED),
            _ => HCI_ERR_UNSPECIFIED,
        }
    }

    pub fn get_parameters(&self) -> &[u8] {
        &self.parameters
    }
}
