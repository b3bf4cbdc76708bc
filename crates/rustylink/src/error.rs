//! Error types for the rustylink library
//!
//! This module defines the error types used throughout the library.

use thiserror::Error;

/// Errors that can occur when working with HCI sockets
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Failed to open HCI socket: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("Failed to bind to HCI device: {0}")]
    BindError(std::io::Error),

    #[error("Failed to send HCI packet: {0}")]
    SendError(std::io::Error),

    #[error("Failed to receive HCI packet: {0}")]
    ReceiveError(std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Unsupported operation")]
    Unsupported,
}

/// Errors returned by the connection layer
///
/// Protocol violations on the receive path are not represented here. They
/// are logged and the offending PDU is dropped where they are detected.
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("Connection not established")]
    NotConnected,

    #[error("No free connection objects")]
    OutOfConnections,

    #[error("No free buffers")]
    OutOfBuffers,

    #[error("No free TX contexts")]
    OutOfTxContexts,

    #[error("Controller rejected the command (status 0x{0:02x})")]
    ControllerRejected(u8),

    #[error("Operation already in progress")]
    Busy,

    #[error("Already in the requested state")]
    Already,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation not supported")]
    NotSupported,

    #[error("Transport error: {0}")]
    Transport(#[from] HciError),
}

impl ConnError {
    /// HCI status code used when this error has to be reported to observers
    pub fn hci_status(&self) -> u8 {
        use crate::hci::constants::*;

        match self {
            Self::ControllerRejected(status) => *status,
            Self::NotConnected => HCI_ERR_UNKNOWN_CONN_ID,
            Self::OutOfConnections => HCI_ERR_CONN_LIMIT_EXCEEDED,
            Self::OutOfBuffers | Self::OutOfTxContexts => HCI_ERR_MEM_CAPACITY_EXCEEDED,
            Self::Busy | Self::Already => HCI_ERR_CMD_DISALLOWED,
            Self::InvalidParameter(_) => HCI_ERR_INVALID_PARAM,
            Self::NotSupported => HCI_ERR_UNSUPP_FEATURE_PARAM_VAL,
            Self::Transport(_) => HCI_ERR_UNSPECIFIED,
        }
    }
}

/// Result type for connection layer operations
pub type ConnResult<T> = std::result::Result<T, ConnError>;
