//! Connection table
//!
//! Connection objects live in fixed arrays, one per link family (ACL, SCO,
//! ISO). A slot is free while its reference count is zero. [`ConnRef`] is the
//! counted handle to an allocated slot.

use crate::addr::LeAddr;
use crate::conn::frag::Reassembler;
use crate::conn::sniff::SniffState;
use crate::conn::tx::{TxContext, TxInProgress, TxItem};
use crate::conn::types::*;
use crate::error::{ConnError, ConnResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Timer deadlines owned by a connection
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnTimers {
    /// LE create connection timeout (central)
    pub conn_timeout: Option<Instant>,
    /// Peripheral parameter update
    pub param_update: Option<Instant>,
    /// Throughput report
    pub data_rate: Option<Instant>,
}

impl ConnTimers {
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.conn_timeout, self.param_update, self.data_rate]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Byte counters for throughput logging
#[derive(Debug, Default, Clone, Copy)]
pub struct DataRate {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Mutable connection state, protected by the connection lock
pub struct ConnInner {
    pub conn_type: ConnType,
    pub role: Role,
    /// Controller handle, 0 while unassigned
    pub handle: u16,
    pub state: ConnState,
    /// Local identity index
    pub id: u8,
    /// HCI status or reason recorded for the next notification
    pub err: u8,
    pub sec_level: SecurityLevel,
    pub required_sec_level: SecurityLevel,
    pub flags: ConnFlags,
    pub link: LinkParams,

    /// Outbound buffers not yet handed to the controller
    pub tx_queue: VecDeque<TxItem>,
    /// Head of the queue, waiting for credits to send its remaining fragments
    pub tx_current: Option<TxInProgress>,
    /// Contexts of frames sent and waiting for completion
    pub pending: VecDeque<TxContext>,
    /// Completed-without-callback frames counted ahead of `pending`
    pub pending_no_cb: usize,
    /// Frames handed to the controller and not yet completed
    pub in_flight: usize,

    pub rx: Reassembler,
    pub sniff: SniffState,
    pub timers: ConnTimers,
    pub stats: DataRate,

    /// ACL slot this SCO or ISO link belongs to
    pub parent: Option<usize>,
    /// Reference held while the connection is not DISCONNECTED
    pub lifecycle: Option<ConnRef>,
}

impl ConnInner {
    fn new(conn_type: ConnType) -> Self {
        let link = match conn_type {
            ConnType::Br => LinkParams::new_br(Default::default()),
            ConnType::Le => LinkParams::new_le(LeAddr::NONE, default_le_params()),
            ConnType::Sco => LinkParams::new_sco(Default::default(), 0),
            ConnType::Iso => LinkParams::new_iso(0),
        };
        Self {
            conn_type,
            role: Role::Master,
            handle: 0,
            state: ConnState::Disconnected,
            id: 0,
            err: 0,
            sec_level: SecurityLevel::Low,
            required_sec_level: SecurityLevel::Low,
            flags: ConnFlags::empty(),
            link,
            tx_queue: VecDeque::new(),
            tx_current: None,
            pending: VecDeque::new(),
            pending_no_cb: 0,
            in_flight: 0,
            rx: Reassembler::new(),
            sniff: SniffState::new(),
            timers: ConnTimers::default(),
            stats: DataRate::default(),
            parent: None,
            lifecycle: None,
        }
    }

    pub fn le(&self) -> Option<&LeLink> {
        match &self.link {
            LinkParams::Le(le) => Some(le),
            _ => None,
        }
    }

    pub fn le_mut(&mut self) -> Option<&mut LeLink> {
        match &mut self.link {
            LinkParams::Le(le) => Some(le),
            _ => None,
        }
    }

    pub fn br(&self) -> Option<&BrLink> {
        match &self.link {
            LinkParams::Br(br) => Some(br),
            _ => None,
        }
    }

    pub fn br_mut(&mut self) -> Option<&mut BrLink> {
        match &mut self.link {
            LinkParams::Br(br) => Some(br),
            _ => None,
        }
    }
}

fn default_le_params() -> LeConnParams {
    LeConnParams {
        interval_min: 0x0018,
        interval_max: 0x0028,
        latency: 0,
        timeout: 400,
    }
}

/// Which fixed array a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFamily {
    Acl,
    Sco,
    Iso,
}

impl SlotFamily {
    fn of(conn_type: ConnType) -> Self {
        match conn_type {
            ConnType::Br | ConnType::Le => SlotFamily::Acl,
            ConnType::Sco => SlotFamily::Sco,
            ConnType::Iso => SlotFamily::Iso,
        }
    }
}

/// One slot of the connection table
pub struct Connection {
    family: SlotFamily,
    index: usize,
    refs: AtomicUsize,
    inner: Mutex<ConnInner>,
}

impl Connection {
    fn new(family: SlotFamily, index: usize) -> Self {
        let conn_type = match family {
            SlotFamily::Acl => ConnType::Le,
            SlotFamily::Sco => ConnType::Sco,
            SlotFamily::Iso => ConnType::Iso,
        };
        Self {
            family,
            index,
            refs: AtomicUsize::new(0),
            inner: Mutex::new(ConnInner::new(conn_type)),
        }
    }

    /// Increment the reference count unless it is zero
    fn try_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Counted reference to an allocated connection
///
/// Cloning takes a reference and dropping releases it. Reaching zero has no
/// side effect beyond making the slot available to `allocate` again.
pub struct ConnRef {
    conn: Arc<Connection>,
}

impl ConnRef {
    /// Lock the connection state
    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.conn.inner.lock().unwrap()
    }

    /// Slot index within its array
    pub fn index(&self) -> usize {
        self.conn.index
    }

    pub fn family(&self) -> SlotFamily {
        self.conn.family
    }

    pub fn ref_count(&self) -> usize {
        self.conn.refs.load(Ordering::Acquire)
    }

    pub fn conn_type(&self) -> ConnType {
        self.lock().conn_type
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn handle(&self) -> u16 {
        self.lock().handle
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    /// Snapshot of the connection
    pub fn info(&self) -> ConnInfo {
        let inner = self.lock();
        ConnInfo {
            conn_type: inner.conn_type,
            role: inner.role,
            handle: inner.handle,
            state: inner.state,
            id: inner.id,
            security: inner.sec_level,
            link: inner.link.clone(),
        }
    }

    /// Whether both references point at the same slot
    pub fn same(&self, other: &ConnRef) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl Clone for ConnRef {
    fn clone(&self) -> Self {
        self.conn.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            conn: self.conn.clone(),
        }
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        self.conn.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PartialEq for ConnRef {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnRef")
            .field("family", &self.conn.family)
            .field("index", &self.conn.index)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Fixed-capacity connection arrays
pub struct ConnTable {
    acl: Vec<Arc<Connection>>,
    sco: Vec<Arc<Connection>>,
    iso: Vec<Arc<Connection>>,
}

impl ConnTable {
    pub fn new(acl: usize, sco: usize, iso: usize) -> Self {
        let make = |family, count| {
            (0..count)
                .map(|index| Arc::new(Connection::new(family, index)))
                .collect::<Vec<_>>()
        };
        Self {
            acl: make(SlotFamily::Acl, acl),
            sco: make(SlotFamily::Sco, sco),
            iso: make(SlotFamily::Iso, iso),
        }
    }

    fn slots(&self, family: SlotFamily) -> &[Arc<Connection>] {
        match family {
            SlotFamily::Acl => &self.acl,
            SlotFamily::Sco => &self.sco,
            SlotFamily::Iso => &self.iso,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.acl.iter().chain(self.sco.iter()).chain(self.iso.iter())
    }

    /// Claim a free slot for a connection of `conn_type`
    ///
    /// The returned object has fresh per-type fields, no handle and state
    /// DISCONNECTED.
    pub fn allocate(&self, conn_type: ConnType) -> ConnResult<ConnRef> {
        for slot in self.slots(SlotFamily::of(conn_type)) {
            if slot
                .refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            *slot.inner.lock().unwrap() = ConnInner::new(conn_type);
            return Ok(ConnRef { conn: slot.clone() });
        }
        Err(ConnError::OutOfConnections)
    }

    /// Reference to slot `index` of `family`, if allocated
    pub fn get(&self, family: SlotFamily, index: usize) -> Option<ConnRef> {
        let slot = self.slots(family).get(index)?;
        if slot.try_ref() {
            Some(ConnRef { conn: slot.clone() })
        } else {
            None
        }
    }

    /// Find a live connection whose state matches `pred`
    pub fn find(&self, mask: ConnTypeMask, pred: impl Fn(&ConnInner) -> bool) -> Option<ConnRef> {
        for slot in self.all() {
            if !slot.try_ref() {
                continue;
            }
            let conn = ConnRef { conn: slot.clone() };
            let matched = {
                let inner = conn.lock();
                mask.contains(inner.conn_type.mask()) && pred(&inner)
            };
            if matched {
                return Some(conn);
            }
        }
        None
    }

    /// Find the connection owning controller handle `handle`
    ///
    /// Only connections past link establishment have a valid handle.
    pub fn lookup_handle(&self, handle: u16) -> Option<ConnRef> {
        self.find(ConnTypeMask::ALL, |inner| {
            inner.state.has_handle() && inner.handle == handle
        })
    }

    /// Find a connection of `conn_type` to `peer` on local identity `id`
    ///
    /// For LE the peer may be known by its identity or by the resolvable
    /// address it used on air, which depends on the local role.
    pub fn lookup_addr(&self, conn_type: ConnType, id: u8, peer: &LeAddr) -> Option<ConnRef> {
        self.find(conn_type.mask(), |inner| {
            if inner.id != id {
                return false;
            }
            match &inner.link {
                LinkParams::Le(le) => {
                    let on_air = match inner.role {
                        Role::Master => &le.resp_addr,
                        Role::Slave => &le.init_addr,
                    };
                    le.dst == *peer || on_air == peer
                }
                LinkParams::Br(br) => br.dst == peer.addr,
                LinkParams::Sco(sco) => sco.dst == peer.addr,
                LinkParams::Iso(_) => false,
            }
        })
    }

    /// Find a connection of `conn_type` in `state` matching `peer`
    ///
    /// `None` as peer matches any address.
    pub fn lookup_state(
        &self,
        conn_type: ConnType,
        peer: Option<&LeAddr>,
        state: ConnState,
    ) -> Option<ConnRef> {
        self.find(conn_type.mask(), |inner| {
            if inner.state != state {
                return false;
            }
            match (peer, &inner.link) {
                (None, _) => true,
                (Some(peer), LinkParams::Le(le)) => le.dst == *peer,
                (Some(peer), LinkParams::Br(br)) => br.dst == peer.addr,
                (Some(peer), LinkParams::Sco(sco)) => sco.dst == peer.addr,
                (Some(_), LinkParams::Iso(_)) => false,
            }
        })
    }

    /// Run `f` once for every live connection whose type is in `mask`
    pub fn for_each(&self, mask: ConnTypeMask, mut f: impl FnMut(&ConnRef)) {
        for conn in self.collect(mask) {
            f(&conn);
        }
    }

    /// References to every live connection whose type is in `mask`
    pub fn collect(&self, mask: ConnTypeMask) -> Vec<ConnRef> {
        let mut out = Vec::new();
        for slot in self.all() {
            if !slot.try_ref() {
                continue;
            }
            let conn = ConnRef { conn: slot.clone() };
            if mask.contains(conn.conn_type().mask()) {
                out.push(conn);
            }
        }
        out
    }

    /// Children (SCO or ISO) bound to ACL slot `acl_index`
    pub fn children_of(&self, acl_index: usize) -> Vec<ConnRef> {
        let mut out = Vec::new();
        for slot in self.sco.iter().chain(self.iso.iter()) {
            if !slot.try_ref() {
                continue;
            }
            let conn = ConnRef { conn: slot.clone() };
            if conn.lock().parent == Some(acl_index) {
                out.push(conn);
            }
        }
        out
    }

    /// Number of free slots in `family`
    pub fn free_slots(&self, family: SlotFamily) -> usize {
        self.slots(family)
            .iter()
            .filter(|slot| slot.refs.load(Ordering::Acquire) == 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::BdAddr;
    use std::sync::{Barrier, Mutex as StdMutex};
    use std::thread;

    #[test]
    fn test_allocate_until_full() {
        let table = ConnTable::new(2, 1, 0);
        let a = table.allocate(ConnType::Le).unwrap();
        let b = table.allocate(ConnType::Br).unwrap();
        assert!(matches!(
            table.allocate(ConnType::Le),
            Err(ConnError::OutOfConnections)
        ));
        assert!(table.allocate(ConnType::Iso).is_err());

        // SCO has its own array
        let sco = table.allocate(ConnType::Sco).unwrap();
        assert_eq!(sco.conn_type(), ConnType::Sco);
        assert_eq!(sco.state(), ConnState::Disconnected);
        assert_eq!(sco.handle(), 0);

        drop(a);
        let c = table.allocate(ConnType::Le).unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn test_ref_counting() {
        let table = ConnTable::new(1, 0, 0);
        let conn = table.allocate(ConnType::Br).unwrap();
        let clone = conn.clone();
        assert_eq!(conn.ref_count(), 2);
        drop(clone);
        assert_eq!(conn.ref_count(), 1);

        // Lookup of an allocated slot takes a reference
        let found = table.get(SlotFamily::Acl, 0).unwrap();
        assert!(found.same(&conn));
        assert_eq!(conn.ref_count(), 2);
        drop(found);
        drop(conn);

        assert!(table.get(SlotFamily::Acl, 0).is_none());
        assert_eq!(table.free_slots(SlotFamily::Acl), 1);
    }

    #[test]
    fn test_lookup_handle_requires_established_link() {
        let table = ConnTable::new(2, 0, 0);
        let conn = table.allocate(ConnType::Le).unwrap();
        {
            let mut inner = conn.lock();
            inner.handle = 0x0042;
            inner.state = ConnState::Connect;
        }
        assert!(table.lookup_handle(0x0042).is_none());

        conn.lock().state = ConnState::Connected;
        assert!(table.lookup_handle(0x0042).unwrap().same(&conn));

        conn.lock().state = ConnState::DisconnectComplete;
        assert!(table.lookup_handle(0x0042).is_some());
        assert!(table.lookup_handle(0x0043).is_none());
    }

    #[test]
    fn test_lookup_addr_matches_on_air_address() {
        let table = ConnTable::new(2, 0, 0);
        let identity = LeAddr::public([1, 2, 3, 4, 5, 6]);
        let rpa = LeAddr::random([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

        let conn = table.allocate(ConnType::Le).unwrap();
        {
            let mut inner = conn.lock();
            inner.role = Role::Slave;
            let le = inner.le_mut().unwrap();
            le.dst = identity;
            le.init_addr = rpa;
        }

        assert!(table.lookup_addr(ConnType::Le, 0, &identity).is_some());
        assert!(table.lookup_addr(ConnType::Le, 0, &rpa).is_some());
        assert!(table.lookup_addr(ConnType::Le, 1, &identity).is_none());
        assert!(table.lookup_addr(ConnType::Br, 0, &identity).is_none());

        // As master the responder address is the alias
        conn.lock().role = Role::Master;
        assert!(table.lookup_addr(ConnType::Le, 0, &rpa).is_none());
    }

    #[test]
    fn test_for_each_filters_by_type() {
        let table = ConnTable::new(3, 1, 0);
        let _le = table.allocate(ConnType::Le).unwrap();
        let br = table.allocate(ConnType::Br).unwrap();
        br.lock().link = LinkParams::new_br(BdAddr::new([9; 6]));
        let _sco = table.allocate(ConnType::Sco).unwrap();

        let mut seen = Vec::new();
        table.for_each(ConnTypeMask::ACL, |conn| seen.push(conn.conn_type()));
        assert_eq!(seen, vec![ConnType::Le, ConnType::Br]);

        let mut count = 0;
        table.for_each(ConnTypeMask::ALL, |_| count += 1);
        assert_eq!(count, 3);

        let peer = LeAddr::public([9; 6]);
        assert!(table
            .lookup_state(ConnType::Br, Some(&peer), ConnState::Disconnected)
            .is_some());
    }

    #[test]
    fn test_concurrent_allocation_is_exclusive() {
        const THREADS: usize = 8;
        let table = Arc::new(ConnTable::new(4, 0, 0));
        let start = Arc::new(Barrier::new(THREADS));
        let done = Arc::new(Barrier::new(THREADS));
        let claimed = Arc::new(StdMutex::new(Vec::new()));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let table = table.clone();
                let start = start.clone();
                let done = done.clone();
                let claimed = claimed.clone();
                thread::spawn(move || {
                    start.wait();
                    let conn = table.allocate(ConnType::Le).ok();
                    if let Some(conn) = &conn {
                        claimed.lock().unwrap().push(conn.index());
                    }
                    // Hold the slot until everyone has tried
                    done.wait();
                    drop(conn);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let mut claimed = claimed.lock().unwrap().clone();
        claimed.sort_unstable();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, claimed.len());
        assert_eq!(claimed.len(), 4);
        assert_eq!(table.free_slots(SlotFamily::Acl), 4);
    }
}
