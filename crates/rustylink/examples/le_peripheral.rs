//! Example: Accepting LE connections
//!
//! Advertises as connectable on device 0 and prints connection events until
//! Enter is pressed.

use rustylink::conn::{ConnManager, ConnRef, ConnectionObserver, RemoteInfo};
use rustylink::hci::{HciSocket, Transport};
use rustylink::{ConnConfig, SecurityLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Printer;

impl ConnectionObserver for Printer {
    fn connected(&self, conn: &ConnRef, err: u8) {
        if err != 0 {
            println!("Connection failed: 0x{:02x}", err);
            return;
        }
        let info = conn.info();
        println!("Connected: handle 0x{:04x}, role {:?}", info.handle, info.role);
    }

    fn disconnected(&self, conn: &ConnRef, reason: u8) {
        println!("Disconnected: handle 0x{:04x}, reason 0x{:02x}", conn.handle(), reason);
    }

    fn security_changed(&self, conn: &ConnRef, level: SecurityLevel, err: u8) {
        println!("Security of 0x{:04x} now {:?} (0x{:02x})", conn.handle(), level, err);
    }

    fn remote_info_available(&self, conn: &ConnRef, info: &RemoteInfo) {
        println!("Remote features of 0x{:04x}: {:02x?}", conn.handle(), info.features);
    }

    fn le_param_updated(&self, conn: &ConnRef, interval: u16, latency: u16, timeout: u16, status: u8) {
        println!(
            "Parameters of 0x{:04x}: interval {} latency {} timeout {} (0x{:02x})",
            conn.handle(),
            interval,
            latency,
            timeout,
            status
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket = match HciSocket::open(0) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            eprintln!("Failed to open HCI socket: {}", e);
            eprintln!("This might be because:");
            eprintln!("1. No Bluetooth adapter is available");
            eprintln!("2. You don't have sufficient permissions to access the Bluetooth device");
            return Err(e.into());
        }
    };

    let transport: Arc<dyn Transport> = socket.clone();
    let manager = Arc::new(ConnManager::new(transport, ConnConfig::default()));
    manager.register_observer(Arc::new(Printer));

    let worker = {
        let manager = manager.clone();
        thread::spawn(move || manager.run_worker())
    };

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let manager = manager.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match socket.read_packet_timeout(Some(Duration::from_millis(100))) {
                    Ok(packet) => manager.handle_packet(packet),
                    Err(e) if e.to_string().contains("Timed out") => continue,
                    Err(e) => eprintln!("Error reading packet: {}", e),
                }
            }
        })
    };

    manager.advertise_connectable(None)?;
    println!("Advertising, press Enter to stop...");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    manager.disconnect_all(rustylink::conn::ConnTypeMask::ALL, 0x13);
    stop.store(true, Ordering::SeqCst);
    reader.join().ok();
    manager.shutdown();
    worker.join().ok();
    Ok(())
}
