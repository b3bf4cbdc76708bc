//! HCI Socket implementation for Bluetooth communication
//!
//! This module provides a wrapper around the raw HCI socket interface. It is
//! the [`Transport`] used on Linux hosts.

use crate::error::HciError;
use crate::hci::constants::*;
use crate::hci::packet::{HciCommand, HciEvent};
use crate::hci::transport::{HciPacket, PacketKind, Transport};
use log::trace;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_RAW: u16 = 0;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

// Large enough for an LE ACL frame with the maximum data length extension
const HCI_MAX_FRAME_SIZE: usize = 1028;

/// Represents an HCI socket
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
}

// Define the sockaddr_hci structure
#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

// Kernel-side packet filter for raw HCI sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciSocket {
    /// Gets the raw file descriptor for the socket
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Opens a new HCI socket
    ///
    /// # Arguments
    ///
    /// * `dev_id` - The device ID to open (0 for the first device)
    ///
    /// The socket is set up to receive events and all data packet types.
    pub fn open(dev_id: u16) -> Result<Self, HciError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) };

        if fd < 0 {
            return Err(HciError::SocketError(std::io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };

        let result = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            unsafe { libc::close(fd) };
            return Err(HciError::BindError(std::io::Error::last_os_error()));
        }

        let socket = HciSocket { fd };
        socket.set_filter()?;
        Ok(socket)
    }

    fn set_filter(&self) -> Result<(), HciError> {
        let filter = HciFilter {
            type_mask: (1 << HCI_EVENT_PKT) | (1 << HCI_ACL_PKT) | (1 << HCI_SCO_PKT) | (1 << HCI_ISO_PKT),
            event_mask: [u32::MAX, u32::MAX],
            opcode: 0,
        };

        let result = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                &filter as *const _ as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };

        if result < 0 {
            return Err(HciError::SocketError(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Read the next packet from the controller
    pub fn read_packet(&self) -> Result<HciPacket, HciError> {
        let mut buffer = [0u8; HCI_MAX_FRAME_SIZE + 1];

        let bytes_read = unsafe {
            libc::read(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };

        if bytes_read < 0 {
            return Err(HciError::ReceiveError(std::io::Error::last_os_error()));
        }

        let bytes_read = bytes_read as usize;
        if bytes_read < 2 {
            return Err(HciError::InvalidPacketFormat);
        }

        let body = &buffer[1..bytes_read];
        trace!("hci rx {:02x} {}", buffer[0], hex::encode(body));

        match buffer[0] {
            HCI_EVENT_PKT => HciEvent::parse(body)
                .map(HciPacket::Event)
                .ok_or(HciError::InvalidPacketFormat),
            HCI_ACL_PKT if body.len() >= HCI_ACL_HDR_SIZE => Ok(HciPacket::Acl(body.to_vec())),
            HCI_SCO_PKT if body.len() >= HCI_SCO_HDR_SIZE => Ok(HciPacket::Sco(body.to_vec())),
            HCI_ISO_PKT if body.len() >= HCI_ISO_HDR_SIZE => Ok(HciPacket::Iso(body.to_vec())),
            _ => Err(HciError::InvalidPacketFormat),
        }
    }

    /// Read the next packet with a timeout
    pub fn read_packet_timeout(&self, timeout: Option<Duration>) -> Result<HciPacket, HciError> {
        if let Some(timeout) = timeout {
            let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
            unsafe {
                libc::FD_ZERO(&mut read_fds);
                libc::FD_SET(self.fd, &mut read_fds);
            }

            let mut timeout_val = libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            };

            let result = unsafe {
                libc::select(
                    self.fd + 1,
                    &mut read_fds,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    &mut timeout_val,
                )
            };

            if result < 0 {
                return Err(HciError::ReceiveError(std::io::Error::last_os_error()));
            }

            if result == 0 {
                return Err(HciError::ReceiveError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Timed out waiting for HCI packet",
                )));
            }
        }

        self.read_packet()
    }

    fn write_all(&self, packet: &[u8]) -> Result<(), HciError> {
        match unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        } {
            -1 => Err(HciError::SendError(std::io::Error::last_os_error())),
            n if (n as usize) < packet.len() => Err(HciError::SendError(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "Short write to HCI socket",
            ))),
            _ => Ok(()),
        }
    }
}

impl Transport for HciSocket {
    fn send_command(&self, command: &HciCommand) -> Result<(), HciError> {
        self.write_all(&command.to_packet())
    }

    fn send_data(&self, kind: PacketKind, frame: &[u8]) -> Result<(), HciError> {
        if frame.len() > HCI_MAX_FRAME_SIZE {
            return Err(HciError::InvalidParamLength(frame.len()));
        }

        let mut packet = Vec::with_capacity(frame.len() + 1);
        packet.push(kind.indicator());
        packet.extend_from_slice(frame);
        trace!("hci tx {}", hex::encode(&packet));
        self.write_all(&packet)
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
