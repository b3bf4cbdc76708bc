//! Connection event fan-out
//!
//! Observers are notified synchronously on the thread that produced the
//! event, most recently registered first. Every observer sees every event.
//! [`ConnectionObserver::connect_req`] is the only event with a return value:
//! any observer returning `false` vetoes the incoming connection, but the
//! remaining observers are still asked.

use crate::addr::BdAddr;
use crate::conn::table::ConnRef;
use crate::conn::types::{BtMode, DataLenInfo, PhyInfo, RemoteInfo, Role, SecurityLevel};
use std::sync::{Arc, Mutex};

/// Receiver of connection lifecycle and data events
///
/// Every method has an empty default so implementors only pick what they
/// need. Status and reason arguments are HCI error codes, 0 on success.
#[allow(unused_variables)]
pub trait ConnectionObserver: Send + Sync {
    /// Link establishment finished. A non-zero `err` means it failed.
    fn connected(&self, conn: &ConnRef, err: u8) {}

    fn disconnected(&self, conn: &ConnRef, reason: u8) {}

    fn security_changed(&self, conn: &ConnRef, level: SecurityLevel, err: u8) {}

    fn remote_info_available(&self, conn: &ConnRef, info: &RemoteInfo) {}

    fn le_param_updated(
        &self,
        conn: &ConnRef,
        interval: u16,
        latency: u16,
        timeout: u16,
        status: u8,
    ) {
    }

    fn le_data_len_updated(&self, conn: &ConnRef, info: &DataLenInfo) {}

    fn le_phy_updated(&self, conn: &ConnRef, info: &PhyInfo) {}

    fn role_changed(&self, conn: &ConnRef, role: Role) {}

    fn mode_changed(&self, conn: &ConnRef, mode: BtMode, interval: u16) {}

    fn rx_sco_data(&self, conn: &ConnRef, data: &[u8], flags: u8) {}

    /// Payload of a PDU on the connectionless channel, header stripped
    fn rx_connectionless_data(&self, conn: &ConnRef, data: &[u8]) {}

    /// Incoming BR/EDR connection request. Return `false` to reject it.
    fn connect_req(&self, peer: &BdAddr) -> bool {
        true
    }
}

/// Registered observers
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Drop every registered observer
    pub fn unregister_all(&self) {
        self.observers.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observers in notification order. The lock is not held while they run,
    /// so an observer may register another one.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let observers = self.observers.lock().unwrap();
        observers.iter().rev().cloned().collect()
    }

    /// Invoke `f` on every observer
    pub fn notify(&self, f: impl Fn(&dyn ConnectionObserver)) {
        for observer in self.snapshot() {
            f(observer.as_ref());
        }
    }

    /// Ask every observer whether to accept a connection from `peer`
    pub fn connect_req(&self, peer: &BdAddr) -> bool {
        let mut accept = true;
        for observer in self.snapshot() {
            let ok = observer.connect_req(peer);
            accept = accept && ok;
        }
        accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::table::ConnTable;
    use crate::conn::types::ConnType;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        accept: bool,
    }

    impl ConnectionObserver for Recorder {
        fn connected(&self, _conn: &ConnRef, err: u8) {
            self.log.lock().unwrap().push(format!("{}:connected:{}", self.name, err));
        }

        fn connect_req(&self, _peer: &BdAddr) -> bool {
            self.log.lock().unwrap().push(format!("{}:req", self.name));
            self.accept
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, accept: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            accept,
        })
    }

    #[test]
    fn test_notification_order_is_reverse_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        registry.register(recorder("a", &log, true));
        registry.register(recorder("b", &log, true));
        registry.register(recorder("c", &log, true));

        let table = ConnTable::new(1, 0, 0);
        let conn = table.allocate(ConnType::Le).unwrap();
        registry.notify(|o| o.connected(&conn, 0));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["c:connected:0", "b:connected:0", "a:connected:0"]
        );
    }

    #[test]
    fn test_connect_req_veto_asks_everyone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        registry.register(recorder("a", &log, true));
        registry.register(recorder("b", &log, false));
        registry.register(recorder("c", &log, true));

        assert!(!registry.connect_req(&BdAddr::new([1; 6])));
        assert_eq!(*log.lock().unwrap(), vec!["c:req", "b:req", "a:req"]);
    }

    #[test]
    fn test_default_methods_and_unregister_all() {
        struct Silent;
        impl ConnectionObserver for Silent {}

        let registry = ObserverRegistry::new();
        registry.register(Arc::new(Silent));
        assert!(registry.connect_req(&BdAddr::ANY));
        assert_eq!(registry.len(), 1);

        registry.unregister_all();
        assert!(registry.is_empty());
        // With nobody left to object, requests are accepted
        assert!(registry.connect_req(&BdAddr::ANY));
    }
}
