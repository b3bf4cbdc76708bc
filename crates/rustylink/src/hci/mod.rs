//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the command, event and data packet formats the
//! connection layer speaks, plus the transport seam to the controller.

pub mod constants;
pub mod data;
pub mod event;
pub mod packet;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod tests;

pub use data::{AclHeader, Boundary, IsoHeader, L2capHeader, ScoHeader};
pub use event::{CompletedPackets, ControllerEvent, LeConnectionComplete};
pub use packet::{HciCommand, HciEvent};
pub use socket::HciSocket;
pub use transport::{HciPacket, PacketKind, Transport};
