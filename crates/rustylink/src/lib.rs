//! RustyLink - Bluetooth connection management over HCI
//!
//! This library keeps track of every link between the host and remote
//! devices: BR/EDR and LE ACL links, SCO audio links and ISO channels. It
//! runs the connection state machine on top of controller events, meters
//! outbound data against the controller's buffer credits, fragments and
//! reassembles ACL traffic, and reports lifecycle changes to registered
//! observers.
//!
//! The controller is reached through the [`hci::Transport`] trait.
//! [`hci::HciSocket`] implements it on Linux raw HCI sockets.

pub mod addr;
pub mod buf;
pub mod config;
pub mod conn;
pub mod error;
pub mod hci;

// Re-export common types for convenience
pub use addr::{AddressType, BdAddr, LeAddr};
pub use buf::{BufPool, NetBuf};
pub use config::ConnConfig;
pub use conn::{
    ConnManager, ConnRef, ConnState, ConnType, ConnectionObserver, IsoHandler, KeyStore,
    LeConnParams, Role, SecurityLevel, UpperLayer,
};
pub use error::{ConnError, ConnResult, HciError};
pub use hci::{HciCommand, HciEvent, HciPacket, HciSocket, Transport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_hci_socket() {
        // This test will only pass if run with sufficient privileges
        // and if a Bluetooth adapter is available
        let result = HciSocket::open(0);

        // Not asserted: CI machines have no adapter or lack privileges
        if let Ok(socket) = result {
            assert!(socket.as_raw_fd() > 0);
        }
    }
}
