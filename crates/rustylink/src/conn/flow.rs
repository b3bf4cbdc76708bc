//! Credit based flow control towards the controller
//!
//! Each pool counts the controller buffers the host may still fill. A sender
//! takes one credit per frame and the Number Of Completed Packets event gives
//! them back. Waiters announce themselves through a waiting flag before they
//! sleep, and a give only wakes sleepers when such a flag is set.

use crate::conn::table::{ConnRef, ConnTable};
use crate::conn::types::{ConnFlags, ConnState, ConnType, ConnTypeMask};
use crate::error::{ConnError, ConnResult};
use log::{trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Controller buffer pool a connection draws its credits from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditPool {
    Br,
    Le,
    Iso,
}

struct CreditState {
    available: usize,
    capacity: usize,
    /// Bumped on every wake so sleepers can tell a wake from a spurious return
    generation: u64,
}

/// Counting semaphore over controller buffer slots
pub struct CreditSemaphore {
    name: &'static str,
    state: Mutex<CreditState>,
    cond: Condvar,
}

impl CreditSemaphore {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            state: Mutex::new(CreditState {
                available: capacity,
                capacity,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().available
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// Take a credit without waiting
    pub fn try_take(&self) -> bool {
        self.try_take_above(0).is_ok()
    }

    /// Take a credit if more than `reserve` are available
    ///
    /// On failure the current wake generation is returned for
    /// [`wait_change`](Self::wait_change).
    pub fn try_take_above(&self, reserve: usize) -> Result<(), u64> {
        let mut state = self.state.lock().unwrap();
        if state.available > reserve {
            state.available -= 1;
            Ok(())
        } else {
            Err(state.generation)
        }
    }

    /// Sleep until the wake generation moves past `seen`
    pub fn wait_change(&self, seen: u64) {
        let state = self.state.lock().unwrap();
        let _state = self
            .cond
            .wait_while(state, |state| state.generation == seen)
            .unwrap();
    }

    /// Return `count` credits. The count never exceeds the capacity.
    pub fn give(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        let room = state.capacity - state.available;
        if count > room {
            warn!(
                "{}: controller returned {} credits, only {} outstanding",
                self.name, count, room
            );
        }
        state.available += count.min(room);
        trace!("{}: {} credits available", self.name, state.available);
    }

    /// Wake every sleeper so it re-evaluates its condition
    pub fn wake_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

impl fmt::Debug for CreditSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CreditSemaphore")
            .field("name", &self.name)
            .field("available", &state.available)
            .field("capacity", &state.capacity)
            .finish()
    }
}

/// Credit pools for BR/EDR, LE and ISO traffic
pub struct FlowController {
    br: CreditSemaphore,
    /// `None` when the controller shares its BR/EDR buffers with LE
    le: Option<CreditSemaphore>,
    iso: CreditSemaphore,
    /// Credits a BR/EDR link without frames in flight must leave untouched
    br_reserve: usize,
    le_waiting: AtomicBool,
    iso_waiting: AtomicBool,
}

impl FlowController {
    pub fn new(
        br_credits: usize,
        le_credits: Option<usize>,
        iso_credits: usize,
        br_reserve: usize,
    ) -> Self {
        Self {
            br: CreditSemaphore::new("br-acl", br_credits),
            le: le_credits.map(|credits| CreditSemaphore::new("le-acl", credits)),
            iso: CreditSemaphore::new("iso", iso_credits),
            br_reserve,
            le_waiting: AtomicBool::new(false),
            iso_waiting: AtomicBool::new(false),
        }
    }

    /// Pool used by `conn_type`, `None` for links that are not flow controlled
    pub fn pool_for(&self, conn_type: ConnType) -> Option<CreditPool> {
        match conn_type {
            ConnType::Br => Some(CreditPool::Br),
            ConnType::Le if self.le.is_some() => Some(CreditPool::Le),
            ConnType::Le => Some(CreditPool::Br),
            ConnType::Iso => Some(CreditPool::Iso),
            ConnType::Sco => None,
        }
    }

    pub fn semaphore(&self, pool: CreditPool) -> &CreditSemaphore {
        match pool {
            CreditPool::Br => &self.br,
            CreditPool::Le => self.le.as_ref().unwrap_or(&self.br),
            CreditPool::Iso => &self.iso,
        }
    }

    pub fn available(&self, pool: CreditPool) -> usize {
        self.semaphore(pool).available()
    }

    /// BR/EDR links flag themselves. LE and ISO share one flag per type,
    /// which only a give clears since other senders may still be asleep.
    fn set_waiting(&self, conn: &ConnRef, conn_type: ConnType, waiting: bool) {
        match conn_type {
            ConnType::Br => {
                let mut inner = conn.lock();
                inner.flags.set(ConnFlags::WAIT_PKT_CREDIT, waiting);
            }
            ConnType::Le if waiting => self.le_waiting.store(true, Ordering::SeqCst),
            ConnType::Iso if waiting => self.iso_waiting.store(true, Ordering::SeqCst),
            _ => {}
        }
    }

    /// One attempt at a credit for `conn` from `sem`
    ///
    /// On failure the waiting flag stays set, so the next give reports a
    /// waiter, and the wake generation is returned.
    fn attempt(
        &self,
        conn: &ConnRef,
        conn_type: ConnType,
        sem: &CreditSemaphore,
    ) -> ConnResult<Result<(), u64>> {
        let in_flight = {
            let inner = conn.lock();
            if inner.state != ConnState::Connected {
                drop(inner);
                self.set_waiting(conn, conn_type, false);
                return Err(ConnError::NotConnected);
            }
            inner.in_flight
        };
        let reserve = if conn_type == ConnType::Br && in_flight == 0 {
            self.br_reserve
        } else {
            0
        };

        // Announce before trying so a concurrent give cannot miss us
        self.set_waiting(conn, conn_type, true);
        let taken = sem.try_take_above(reserve);
        if taken.is_ok() {
            self.set_waiting(conn, conn_type, false);
        }
        Ok(taken)
    }

    /// Take one credit for a frame on `conn` if one is free
    ///
    /// `Ok(false)` leaves `conn` flagged as waiting: the give that returns
    /// a credit to its pool reports it.
    pub fn try_take(&self, conn: &ConnRef) -> ConnResult<bool> {
        let conn_type = conn.conn_type();
        let Some(pool) = self.pool_for(conn_type) else {
            return Ok(true);
        };
        Ok(self.attempt(conn, conn_type, self.semaphore(pool))?.is_ok())
    }

    /// Take one credit for a frame on `conn`, waiting as long as needed
    ///
    /// The wait ends early with `NotConnected` once the connection leaves
    /// CONNECTED. A BR/EDR link with nothing in flight may not dip into the
    /// reserve.
    pub fn take(&self, conn: &ConnRef) -> ConnResult<()> {
        let conn_type = conn.conn_type();
        let Some(pool) = self.pool_for(conn_type) else {
            return Ok(());
        };
        let sem = self.semaphore(pool);

        loop {
            match self.attempt(conn, conn_type, sem)? {
                Ok(()) => return Ok(()),
                Err(generation) => {
                    trace!("{}: waiting for a credit", sem.name());
                    sem.wait_change(generation);
                }
            }
        }
    }

    /// Return `count` credits to `pool` and wake waiters if any announced
    /// themselves
    ///
    /// For BR/EDR every connection is rescanned. A waiting flag on a link
    /// with nothing in flight is stale and gets cleared. Returns whether
    /// anybody was waiting.
    pub fn give(&self, pool: CreditPool, count: usize, table: &ConnTable) -> bool {
        let sem = self.semaphore(pool);
        sem.give(count);

        let waiting = match pool {
            CreditPool::Le if self.le.is_some() => self.le_waiting.swap(false, Ordering::SeqCst),
            CreditPool::Iso => self.iso_waiting.swap(false, Ordering::SeqCst),
            // LE traffic on shared buffers waits on the BR pool
            _ => self.release_br_waiters(table) | self.le_waiting.swap(false, Ordering::SeqCst),
        };

        if waiting {
            sem.wake_all();
        }
        waiting
    }

    fn release_br_waiters(&self, table: &ConnTable) -> bool {
        let mut waiting = false;
        table.for_each(ConnTypeMask::BR, |conn| {
            let mut inner = conn.lock();
            if !inner.flags.contains(ConnFlags::WAIT_PKT_CREDIT) {
                return;
            }
            waiting = true;
            if inner.in_flight == 0 {
                inner.flags.remove(ConnFlags::WAIT_PKT_CREDIT);
            }
        });
        waiting
    }

    /// Wake every sleeper in every pool, used when a link goes down
    pub fn wake_all(&self) {
        self.br.wake_all();
        if let Some(le) = &self.le {
            le.wake_all();
        }
        self.iso.wake_all();
    }
}

impl fmt::Debug for FlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowController")
            .field("br", &self.br)
            .field("le", &self.le)
            .field("iso", &self.iso)
            .field("br_reserve", &self.br_reserve)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn connected(table: &ConnTable, conn_type: ConnType, in_flight: usize) -> ConnRef {
        let conn = table.allocate(conn_type).unwrap();
        {
            let mut inner = conn.lock();
            inner.state = ConnState::Connected;
            inner.in_flight = in_flight;
        }
        conn
    }

    #[test]
    fn test_credit_count_stays_in_range() {
        let sem = CreditSemaphore::new("test", 5);
        let mut rng = rand::thread_rng();
        let mut model: usize = 5;

        for _ in 0..1000 {
            if rng.gen_bool(0.5) {
                let taken = sem.try_take();
                assert_eq!(taken, model > 0);
                if taken {
                    model -= 1;
                }
            } else {
                let count = rng.gen_range(0..3);
                sem.give(count);
                model = (model + count).min(5);
            }
            assert_eq!(sem.available(), model);
            assert!(sem.available() <= sem.capacity());
        }
    }

    #[test]
    fn test_reserve_applies_to_idle_br_links_only() {
        let table = ConnTable::new(3, 0, 0);
        let flow = FlowController::new(2, Some(1), 1, 1);
        let idle = connected(&table, ConnType::Br, 0);
        let busy = connected(&table, ConnType::Br, 1);

        flow.take(&idle).unwrap();
        assert_eq!(flow.available(CreditPool::Br), 1);

        // The last credit is reserved for links that already have frames out
        flow.take(&busy).unwrap();
        assert_eq!(flow.available(CreditPool::Br), 0);

        // LE has no reserve
        let le = connected(&table, ConnType::Le, 0);
        flow.take(&le).unwrap();
        assert_eq!(flow.available(CreditPool::Le), 0);
    }

    #[test]
    fn test_shared_le_buffers_use_br_pool() {
        let flow = FlowController::new(4, None, 1, 1);
        assert_eq!(flow.pool_for(ConnType::Le), Some(CreditPool::Br));
        assert_eq!(flow.pool_for(ConnType::Sco), None);

        let table = ConnTable::new(1, 0, 0);
        let le = connected(&table, ConnType::Le, 0);
        flow.take(&le).unwrap();
        assert_eq!(flow.available(CreditPool::Br), 3);
    }

    #[test]
    fn test_blocked_take_released_by_give() {
        let table = Arc::new(ConnTable::new(1, 0, 0));
        let flow = Arc::new(FlowController::new(1, Some(1), 1, 0));
        let conn = connected(&table, ConnType::Le, 1);
        flow.take(&conn).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let flow = flow.clone();
            let conn = conn.clone();
            thread::spawn(move || {
                let result = flow.take(&conn);
                tx.send(()).unwrap();
                result
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        flow.give(CreditPool::Le, 1, &table);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(flow.available(CreditPool::Le), 0);
    }

    #[test]
    fn test_waiter_aborts_when_link_goes_down() {
        let table = Arc::new(ConnTable::new(1, 0, 0));
        let flow = Arc::new(FlowController::new(0, Some(0), 0, 0));
        let conn = connected(&table, ConnType::Le, 0);

        let waiter = {
            let flow = flow.clone();
            let conn = conn.clone();
            thread::spawn(move || flow.take(&conn))
        };

        thread::sleep(Duration::from_millis(20));
        conn.lock().state = ConnState::Disconnect;
        flow.wake_all();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(ConnError::NotConnected)
        ));
    }

    #[test]
    fn test_try_take_flags_waiter_for_next_give() {
        let table = ConnTable::new(2, 0, 0);
        let flow = FlowController::new(1, Some(1), 1, 0);
        let le = connected(&table, ConnType::Le, 0);

        assert!(flow.try_take(&le).unwrap());
        assert!(!flow.try_take(&le).unwrap());
        assert!(flow.give(CreditPool::Le, 1, &table));
        // The flag is consumed by the give that reported it
        assert!(!flow.give(CreditPool::Le, 0, &table));
        assert!(flow.try_take(&le).unwrap());

        let br = connected(&table, ConnType::Br, 1);
        flow.take(&br).unwrap();
        assert!(!flow.try_take(&br).unwrap());
        assert!(br.lock().flags.contains(ConnFlags::WAIT_PKT_CREDIT));
        assert!(flow.give(CreditPool::Br, 1, &table));
        assert!(flow.try_take(&br).unwrap());
        assert!(!br.lock().flags.contains(ConnFlags::WAIT_PKT_CREDIT));

        br.lock().state = ConnState::Disconnect;
        assert!(matches!(flow.try_take(&br), Err(ConnError::NotConnected)));
    }

    #[test]
    fn test_give_clears_stale_br_waiting_flags() {
        let table = Arc::new(ConnTable::new(2, 0, 0));
        let flow = Arc::new(FlowController::new(1, Some(1), 1, 1));

        // First link used the only credit and now waits for another one
        let sender = connected(&table, ConnType::Br, 1);
        flow.take(&sender).unwrap();
        assert_eq!(flow.available(CreditPool::Br), 0);

        // Second link has a leftover flag but nothing in flight
        let stale = connected(&table, ConnType::Br, 0);
        stale.lock().flags.insert(ConnFlags::WAIT_PKT_CREDIT);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let flow = flow.clone();
            let sender = sender.clone();
            thread::spawn(move || {
                let result = flow.take(&sender);
                tx.send(()).unwrap();
                result
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(sender.lock().flags.contains(ConnFlags::WAIT_PKT_CREDIT));

        flow.give(CreditPool::Br, 1, &table);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(waiter.join().unwrap().is_ok());

        assert!(!sender.lock().flags.contains(ConnFlags::WAIT_PKT_CREDIT));
        assert!(!stale.lock().flags.contains(ConnFlags::WAIT_PKT_CREDIT));
        assert_eq!(flow.available(CreditPool::Br), 0);
    }
}
