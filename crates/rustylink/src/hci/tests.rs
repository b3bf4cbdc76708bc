//! Unit tests for HCI packet parsing and serialization

use super::constants::*;
use super::data::*;
use super::event::*;
use super::packet::*;
use crate::addr::{AddressType, BdAddr};

#[test]
fn test_hci_command_serialization() {
    // Disconnect
    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: 0x13,
    };

    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);

    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x0406); // OGF_LINK_CTL << 10 | OCF_DISCONNECT

    assert_eq!(packet[3], 3);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040);
    assert_eq!(packet[6], 0x13);

    // Sniff mode
    let command = HciCommand::SniffMode {
        handle: 0x0001,
        max_interval: 0x0320,
        min_interval: 0x0190,
        attempt: 4,
        timeout: 1,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0803);
    assert_eq!(packet[3], 10);
    assert_eq!(u16::from_le_bytes([packet[6], packet[7]]), 0x0320);
    assert_eq!(u16::from_le_bytes([packet[8], packet[9]]), 0x0190);

    // LE Connection Update
    let command = HciCommand::LeConnectionUpdate {
        handle: 0x0002,
        interval_min: 24,
        interval_max: 40,
        latency: 0,
        timeout: 42,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x2013);
    assert_eq!(packet[3], 14);
    assert_eq!(u16::from_le_bytes([packet[10], packet[11]]), 0);
    assert_eq!(u16::from_le_bytes([packet[12], packet[13]]), 42);

    // Raw command
    let command = HciCommand::new(OGF_LE, OCF_LE_CREATE_CONNECTION, vec![0x01, 0x02, 0x03]);
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x200D);
    assert_eq!(packet[3], 3);
    assert_eq!(&packet[4..], &[0x01, 0x02, 0x03]);
}

#[test]
fn test_hci_event_parsing() {
    let data = [
        EVT_CMD_COMPLETE, // Event code
        4,                // Parameter length
        1,                // Num_HCI_Command_Packets
        0x06,             // Command_Opcode (low byte)
        0x04,             // Command_Opcode (high byte)
        0x00,             // Status
    ];

    let event = HciEvent::parse(&data).unwrap();

    assert_eq!(event.event_code, EVT_CMD_COMPLETE);
    assert_eq!(event.parameter_total_length, 4);
    assert!(event.is_command_complete(OGF_LINK_CTL, OCF_DISCONNECT));
    assert!(!event.is_command_complete(OGF_LE, OCF_LE_CONN_UPDATE));
    assert_eq!(event.get_status(), 0x00);

    // Invalid data tests
    assert!(HciEvent::parse(&[]).is_none());
    assert!(HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]).is_none());
}

#[test]
fn test_number_of_completed_packets() {
    let event = HciEvent::new(
        EVT_NUM_COMPLETED_PACKETS,
        vec![2, 0x01, 0x00, 0x03, 0x00, 0x02, 0x20, 0x01, 0x00],
    );

    let parsed = ControllerEvent::parse(&event).unwrap();
    assert_eq!(
        parsed,
        ControllerEvent::NumberOfCompletedPackets(vec![
            CompletedPackets { handle: 0x0001, count: 3 },
            // flag bits above the 12-bit handle are masked off
            CompletedPackets { handle: 0x0002, count: 1 },
        ])
    );

    // Truncated entry list
    let event = HciEvent::new(EVT_NUM_COMPLETED_PACKETS, vec![2, 0x01, 0x00, 0x03, 0x00]);
    assert!(ControllerEvent::parse(&event).is_none());
}

#[test]
fn test_le_connection_complete_parsing() {
    let mut params = vec![EVT_LE_CONN_COMPLETE, 0x00];
    params.extend_from_slice(&0x0040u16.to_le_bytes());
    params.push(HCI_ROLE_SLAVE);
    params.push(0x01); // random
    params.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
    params.extend_from_slice(&0x0018u16.to_le_bytes());
    params.extend_from_slice(&0x0000u16.to_le_bytes());
    params.extend_from_slice(&0x002Au16.to_le_bytes());
    params.push(0x00);

    let event = HciEvent::new(EVT_LE_META_EVENT, params);
    match ControllerEvent::parse(&event) {
        Some(ControllerEvent::LeConnectionComplete(complete)) => {
            assert_eq!(complete.status, 0);
            assert_eq!(complete.handle, 0x0040);
            assert_eq!(complete.role, HCI_ROLE_SLAVE);
            assert_eq!(complete.peer.addr_type, AddressType::Random);
            assert_eq!(complete.peer.addr, BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]));
            assert_eq!(complete.interval, 0x0018);
            assert_eq!(complete.timeout, 0x002A);
            assert!(complete.local_rpa.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_disconnection_and_mode_change_parsing() {
    let event = HciEvent::new(EVT_DISCONN_COMPLETE, vec![0x00, 0x05, 0x00, 0x13]);
    assert_eq!(
        ControllerEvent::parse(&event),
        Some(ControllerEvent::DisconnectionComplete {
            status: 0,
            handle: 5,
            reason: HCI_ERR_REMOTE_USER_TERM_CONN,
        })
    );

    let event = HciEvent::new(EVT_MODE_CHANGE, vec![0x00, 0x01, 0x00, HCI_MODE_SNIFF, 0x20, 0x03]);
    assert_eq!(
        ControllerEvent::parse(&event),
        Some(ControllerEvent::ModeChange {
            status: 0,
            handle: 1,
            mode: HCI_MODE_SNIFF,
            interval: 0x0320,
        })
    );

    // Unrelated events are ignored
    let event = HciEvent::new(EVT_CMD_STATUS, vec![0x00, 0x01, 0x05, 0x04]);
    assert!(ControllerEvent::parse(&event).is_none());
}

#[test]
fn test_acl_header() {
    let header = AclHeader::outbound(0x0123, Boundary::Start, false, 27);
    let bytes = header.to_bytes();
    assert_eq!(bytes, [0x23, 0x01, 27, 0]);

    let header = AclHeader::outbound(0x0123, Boundary::End, false, 5);
    let parsed = AclHeader::parse(&header.to_bytes()).unwrap();
    assert_eq!(parsed.pb_flag, ACL_PB_CONT);
    assert!(!parsed.is_start());

    let header = AclHeader::outbound(0x0001, Boundary::Single, true, 8);
    let parsed = AclHeader::parse(&header.to_bytes()).unwrap();
    assert_eq!(parsed.pb_flag, ACL_PB_START);
    assert_eq!(parsed.handle, 0x0001);
    assert_eq!(parsed.length, 8);

    assert!(AclHeader::parse(&[0x01, 0x00]).is_none());
}

#[test]
fn test_iso_header_keeps_end_flag() {
    for boundary in [Boundary::Start, Boundary::Continue, Boundary::End, Boundary::Single] {
        let header = IsoHeader::new(0x0100, boundary, 40);
        let parsed = IsoHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.boundary, boundary);
        assert_eq!(parsed.handle, 0x0100);
    }
}

#[test]
fn test_l2cap_header() {
    let header = L2capHeader::new(10, 0x0040);
    let parsed = L2capHeader::parse(&header.to_bytes()).unwrap();
    assert_eq!(parsed.length, 10);
    assert_eq!(parsed.channel_id, 0x0040);
    assert_eq!(parsed.pdu_len(), 14);
}
