//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_ISO_PKT: u8 = 0x05;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Data packet header sizes
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_SCO_HDR_SIZE: usize = 3;
pub const HCI_ISO_HDR_SIZE: usize = 4;

// Connection handles are 12 bits wide
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;

// ACL packet boundary flags
pub const ACL_PB_START_NO_FLUSH: u8 = 0x00;
pub const ACL_PB_CONT: u8 = 0x01;
pub const ACL_PB_START: u8 = 0x02;
pub const ACL_PB_COMPLETE: u8 = 0x03;

// ACL broadcast flags
pub const ACL_BC_POINT_TO_POINT: u8 = 0x00;
pub const ACL_BC_ACTIVE: u8 = 0x01;

// ISO packet boundary flags
pub const ISO_PB_START: u8 = 0x00;
pub const ISO_PB_CONT: u8 = 0x01;
pub const ISO_PB_SINGLE: u8 = 0x02;
pub const ISO_PB_END: u8 = 0x03;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_CREATE_CONNECTION_CANCEL: u16 = 0x0008;
pub const OCF_ACCEPT_CONN_REQ: u16 = 0x0009;
pub const OCF_REJECT_CONN_REQ: u16 = 0x000A;
pub const OCF_AUTH_REQUESTED: u16 = 0x0011;
pub const OCF_READ_REMOTE_FEATURES: u16 = 0x001B;
pub const OCF_SETUP_SYNC_CONN: u16 = 0x0028;

// Link Policy Commands (OGF: 0x02)
pub const OCF_SNIFF_MODE: u16 = 0x0003;
pub const OCF_EXIT_SNIFF_MODE: u16 = 0x0004;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_ADVERTISE_ENABLE: u16 = 0x000A;
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_CREATE_CONNECTION_CANCEL: u16 = 0x000E;
pub const OCF_LE_CONN_UPDATE: u16 = 0x0013;
pub const OCF_LE_READ_REMOTE_FEATURES: u16 = 0x0016;
pub const OCF_LE_START_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_SET_DATA_LEN: u16 = 0x0022;
pub const OCF_LE_SET_PHY: u16 = 0x0032;

// HCI Events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_REMOTE_FEATURES: u8 = 0x0B;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ROLE_CHANGE: u8 = 0x12;
pub const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
pub const EVT_MODE_CHANGE: u8 = 0x14;
pub const EVT_SYNC_CONN_COMPLETE: u8 = 0x2C;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_REMOTE_FEATURES: u8 = 0x04;
pub const EVT_LE_DATA_LEN_CHANGE: u8 = 0x07;
pub const EVT_LE_ENH_CONN_COMPLETE: u8 = 0x0A;
pub const EVT_LE_PHY_UPDATE_COMPLETE: u8 = 0x0C;

// Link types reported by BR/EDR connection events
pub const LINK_TYPE_SCO: u8 = 0x00;
pub const LINK_TYPE_ACL: u8 = 0x01;
pub const LINK_TYPE_ESCO: u8 = 0x02;

// Role values used by connection events and commands
pub const HCI_ROLE_MASTER: u8 = 0x00;
pub const HCI_ROLE_SLAVE: u8 = 0x01;

// Current mode values reported by the Mode Change event
pub const HCI_MODE_ACTIVE: u8 = 0x00;
pub const HCI_MODE_SNIFF: u8 = 0x02;

// HCI error codes used by the connection layer
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_UNKNOWN_CONN_ID: u8 = 0x02;
pub const HCI_ERR_AUTH_FAIL: u8 = 0x05;
pub const HCI_ERR_MEM_CAPACITY_EXCEEDED: u8 = 0x07;
pub const HCI_ERR_CONN_LIMIT_EXCEEDED: u8 = 0x09;
pub const HCI_ERR_CMD_DISALLOWED: u8 = 0x0C;
pub const HCI_ERR_INSUFFICIENT_RESOURCES: u8 = 0x0D;
pub const HCI_ERR_REJ_BAD_ADDR: u8 = 0x0F;
pub const HCI_ERR_INVALID_PARAM: u8 = 0x12;
pub const HCI_ERR_REMOTE_USER_TERM_CONN: u8 = 0x13;
pub const HCI_ERR_REMOTE_LOW_RESOURCES: u8 = 0x14;
pub const HCI_ERR_LOCALHOST_TERM_CONN: u8 = 0x16;
pub const HCI_ERR_UNSUPP_FEATURE_PARAM_VAL: u8 = 0x11;
pub const HCI_ERR_UNSUPP_REMOTE_FEATURE: u8 = 0x1A;
pub const HCI_ERR_UNSPECIFIED: u8 = 0x1F;
pub const HCI_ERR_ADV_TIMEOUT: u8 = 0x3C;

// LE feature bits (first octet of the LE feature mask)
pub const LE_FEAT_ENC: u8 = 0x01;
pub const LE_FEAT_CONN_PARAM_REQ: u8 = 0x02;
pub const LE_FEAT_DATA_LEN: u8 = 0x20;

// L2CAP basic header
pub const L2CAP_HDR_SIZE: usize = 4;
pub const L2CAP_CID_CONNECTIONLESS: u16 = 0x0002;
