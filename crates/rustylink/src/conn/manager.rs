//! Connection manager
//!
//! [`ConnManager`] owns the connection table and the shared resources every
//! link draws from: controller credits, TX contexts and fragment buffers.
//! Three things drive it:
//!
//! * the public API, which starts, tunes and ends links and queues data,
//! * the controller feed ([`ConnManager::handle_packet`]), which moves the
//!   state machine and completes transmitted frames,
//! * the processing pass ([`ConnManager::process`]), which drains the TX
//!   queues, runs per-connection timers and finishes disconnect cleanup.
//!
//! The pass runs on whatever thread calls it. [`ConnManager::run_worker`]
//! loops it on a dedicated thread, sleeping until there is work or the next
//! timer is due.

use crate::addr::{BdAddr, LeAddr};
use crate::buf::{BufPool, NetBuf};
use crate::config::ConnConfig;
use crate::conn::flow::FlowController;
use crate::conn::frag::{Fragment, Fragmenter, RxOutcome};
use crate::conn::observer::{ConnectionObserver, ObserverRegistry};
use crate::conn::table::{ConnInner, ConnRef, ConnTable, ConnTimers, DataRate};
use crate::conn::tx::{CompletionScope, TxCallback, TxContext, TxInProgress, TxItem, TxPool};
use crate::conn::types::*;
use crate::conn::upper::{IsoHandler, KeyStore, UpperLayer};
use crate::error::{ConnError, ConnResult};
use crate::hci::constants::*;
use crate::hci::data::{AclHeader, IsoHeader, L2capHeader, ScoHeader};
use crate::hci::event::{
    CompletedPackets, ConnectionComplete, ControllerEvent, LeConnectionComplete,
    SyncConnectionComplete,
};
use crate::hci::packet::{HciCommand, HciEvent};
use crate::hci::transport::{HciPacket, PacketKind, Transport};
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

/// Default eSCO packet types: EV3, EV4, EV5 and the 2/3-EV3 exclusions
const ESCO_PKT_DEFAULT: u16 = 0x003F;
/// CVSD, 16-bit linear input
const VOICE_SETTING_DEFAULT: u16 = 0x0060;
const SCO_BANDWIDTH: u32 = 8000;
const SCO_MAX_LATENCY: u16 = 0x0007;
const SNIFF_ATTEMPT: u16 = 4;
const SNIFF_TIMEOUT: u16 = 1;
/// R2 page scan repetition mode
const PAGE_SCAN_REP_MODE: u8 = 0x02;

/// Take everything queued on a link that never reached the controller,
/// the parked head first
fn drain_unsent(inner: &mut ConnInner) -> Vec<Option<TxContext>> {
    let current = inner.tx_current.take().map(|current| current.ctx);
    current
        .into_iter()
        .chain(inner.tx_queue.drain(..).map(|item| item.ctx))
        .collect()
}

/// Next buffer to work on in a TX pass
enum NextTx {
    Resume(TxInProgress),
    Fresh(TxItem),
}

struct WorkState {
    /// Set whenever something was queued since the last pass
    pending: bool,
    shutdown: bool,
}

/// Central connection manager, see the module docs
pub struct ConnManager {
    transport: Arc<dyn Transport>,
    config: ConnConfig,
    table: ConnTable,
    flow: FlowController,
    tx_pool: TxPool,
    /// Continuation fragments, headroom for the transport header
    frag_pool: BufPool,
    /// Reassembly buffers for inbound ACL
    rx_pool: BufPool,
    observers: ObserverRegistry,
    upper: RwLock<Option<Arc<dyn UpperLayer>>>,
    iso_handler: RwLock<Option<Arc<dyn IsoHandler>>>,
    keys: RwLock<Option<Arc<dyn KeyStore>>>,
    work: Mutex<WorkState>,
    work_cond: Condvar,
}

impl ConnManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnConfig) -> Self {
        let frag_size = config
            .br_acl_mtu
            .max(config.le_acl_mtu())
            .max(config.iso_mtu);
        let le_credits = config.le_acl.map(|(_, credits)| credits);

        debug!(
            "connection manager: {} ACL, {} SCO, {} ISO slots, {} TX contexts",
            config.max_acl_conns, config.max_sco_conns, config.max_iso_conns, config.tx_contexts
        );

        Self {
            table: ConnTable::new(
                config.max_acl_conns,
                config.max_sco_conns,
                config.max_iso_conns,
            ),
            flow: FlowController::new(
                config.br_acl_credits,
                le_credits,
                config.iso_credits,
                config.br_tx_reserve,
            ),
            tx_pool: TxPool::new(config.tx_contexts),
            frag_pool: BufPool::new("acl-frag", config.frag_bufs, frag_size, HCI_ACL_HDR_SIZE),
            rx_pool: BufPool::new("acl-rx", config.rx_bufs, config.rx_buf_size, 0),
            observers: ObserverRegistry::new(),
            upper: RwLock::new(None),
            iso_handler: RwLock::new(None),
            keys: RwLock::new(None),
            work: Mutex::new(WorkState {
                pending: false,
                shutdown: false,
            }),
            work_cond: Condvar::new(),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn tx_pool(&self) -> &TxPool {
        &self.tx_pool
    }

    pub fn frag_pool(&self) -> &BufPool {
        &self.frag_pool
    }

    pub fn rx_pool(&self) -> &BufPool {
        &self.rx_pool
    }

    pub fn register_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.register(observer);
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn set_upper_layer(&self, upper: Arc<dyn UpperLayer>) {
        *self.upper.write().unwrap() = Some(upper);
    }

    pub fn set_iso_handler(&self, handler: Arc<dyn IsoHandler>) {
        *self.iso_handler.write().unwrap() = Some(handler);
    }

    pub fn set_key_store(&self, keys: Arc<dyn KeyStore>) {
        *self.keys.write().unwrap() = Some(keys);
    }

    fn upper_layer(&self) -> Option<Arc<dyn UpperLayer>> {
        self.upper.read().unwrap().clone()
    }

    fn iso(&self) -> Option<Arc<dyn IsoHandler>> {
        self.iso_handler.read().unwrap().clone()
    }

    fn key_store(&self) -> Option<Arc<dyn KeyStore>> {
        self.keys.read().unwrap().clone()
    }

    /// Outbound buffer with headroom for the transport header
    pub fn tx_buf(&self, payload: &[u8]) -> NetBuf {
        NetBuf::unpooled(HCI_ACL_HDR_SIZE, payload)
    }

    /// Largest frame payload the controller takes for `conn_type`
    pub fn mtu(&self, conn_type: ConnType) -> usize {
        match conn_type {
            ConnType::Br => self.config.br_acl_mtu,
            ConnType::Le => self.config.le_acl_mtu(),
            ConnType::Iso => self.config.iso_mtu,
            ConnType::Sco => self.config.sco_mtu,
        }
    }

    pub fn lookup_handle(&self, handle: u16) -> Option<ConnRef> {
        self.table.lookup_handle(handle)
    }

    pub fn lookup_addr_le(&self, id: u8, peer: &LeAddr) -> Option<ConnRef> {
        self.table.lookup_addr(ConnType::Le, id, peer)
    }

    pub fn lookup_addr_br(&self, peer: &BdAddr) -> Option<ConnRef> {
        self.table
            .lookup_addr(ConnType::Br, 0, &LeAddr::public(peer.bytes))
    }

    fn send_command(&self, command: HciCommand) -> ConnResult<()> {
        trace!("HCI command {:?}", command);
        self.transport.send_command(&command).map_err(|e| {
            warn!("Failed to send HCI command 0x{:04x}: {}", command.opcode(), e);
            ConnError::Transport(e)
        })
    }

    // ----- work scheduling -----

    /// Ask for a processing pass
    pub fn wake_work(&self) {
        let mut work = self.work.lock().unwrap();
        work.pending = true;
        self.work_cond.notify_all();
    }

    /// Stop [`run_worker`](Self::run_worker) after its current pass
    pub fn shutdown(&self) {
        let mut work = self.work.lock().unwrap();
        work.shutdown = true;
        self.work_cond.notify_all();
    }

    /// Run processing passes until [`shutdown`](Self::shutdown)
    pub fn run_worker(&self) {
        info!("Connection worker started");
        loop {
            let next = self.process();
            let mut work = self.work.lock().unwrap();
            loop {
                if work.shutdown {
                    info!("Connection worker stopped");
                    return;
                }
                if work.pending {
                    break;
                }
                match next {
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline <= now {
                            break;
                        }
                        let (guard, _) = self.work_cond.wait_timeout(work, deadline - now).unwrap();
                        work = guard;
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    None => work = self.work_cond.wait(work).unwrap(),
                }
            }
        }
    }

    // ----- state machine -----

    /// Move `conn` to `state`, running the exit and entry actions
    ///
    /// A transition to the current state only logs a warning.
    pub fn set_state(&self, conn: &ConnRef, state: ConnState) {
        self.transition(conn, None, state);
    }

    /// Like [`set_state`](Self::set_state), but only from `from`
    ///
    /// The check and the move happen under one lock, so an event handled on
    /// another thread in between is not overwritten. Returns whether the
    /// connection moved.
    pub fn set_state_from(&self, conn: &ConnRef, from: ConnState, state: ConnState) -> bool {
        self.transition(conn, Some(from), state)
    }

    fn transition(&self, conn: &ConnRef, from: Option<ConnState>, state: ConnState) -> bool {
        let (old, conn_type, role) = {
            let mut inner = conn.lock();
            let old = inner.state;
            if let Some(from) = from.filter(|from| *from != old) {
                debug!(
                    "conn 0x{:04x}: {} -> {} skipped, now {}",
                    inner.handle, from, state, old
                );
                return false;
            }
            if old == state {
                warn!("no transition: conn 0x{:04x} already {}", inner.handle, state);
                return false;
            }
            debug!(
                "{:?} conn 0x{:04x}: {} -> {}",
                inner.conn_type, inner.handle, old, state
            );
            inner.state = state;

            if old == ConnState::Disconnected {
                // Keeps the slot alive until the link is torn down again
                inner.lifecycle = Some(conn.clone());
            }
            if old == ConnState::Connect {
                inner.timers.conn_timeout = None;
            }
            (old, inner.conn_type, inner.role)
        };

        if old == ConnState::Connected {
            // Senders blocked on credits re-check the link
            self.flow.wake_all();
        }

        match state {
            ConnState::Connect => {
                if conn_type == ConnType::Le && role == Role::Master {
                    conn.lock().timers.conn_timeout =
                        Some(Instant::now() + self.config.create_conn_timeout);
                    self.wake_work();
                }
            }
            ConnState::Connected => self.enter_connected(conn, conn_type, role),
            ConnState::DisconnectComplete => self.enter_disconnect_complete(conn, conn_type),
            ConnState::Disconnected => self.enter_disconnected(conn, conn_type, old),
            _ => {}
        }
        true
    }

    fn enter_connected(&self, conn: &ConnRef, conn_type: ConnType, role: Role) {
        match conn_type {
            ConnType::Sco => {
                info!("SCO conn 0x{:04x} connected", conn.handle());
                self.observers.notify(|o| o.connected(conn, 0));
                return;
            }
            ConnType::Iso => {
                info!("ISO conn 0x{:04x} connected", conn.handle());
                if let Some(iso) = self.iso() {
                    iso.connected(conn);
                }
                return;
            }
            ConnType::Br | ConnType::Le => {}
        }

        let now = Instant::now();
        {
            let mut inner = conn.lock();
            debug_assert!(inner.tx_queue.is_empty());
            inner.err = 0;
            inner.rx.reset();
            inner.stats = DataRate::default();
            if conn_type == ConnType::Le && role == Role::Slave {
                inner.timers.param_update = Some(now + self.config.param_update_timeout);
            }
            if let Some(interval) = self.config.data_rate_interval {
                inner.timers.data_rate = Some(now + interval);
            }
        }
        info!(
            "{:?} conn 0x{:04x} connected as {:?}",
            conn_type,
            conn.handle(),
            role
        );

        if let Some(upper) = self.upper_layer() {
            upper.connected(conn);
        }
        self.observers.notify(|o| o.connected(conn, 0));

        if self.config.auto_feature_exchange {
            self.read_remote_features(conn);
        }
        self.wake_work();
    }

    /// Return every unacknowledged frame and its credit
    fn enter_disconnect_complete(&self, conn: &ConnRef, conn_type: ConnType) {
        let (pending, in_flight) = {
            let mut inner = conn.lock();
            inner.timers.data_rate = None;
            let pending: Vec<TxContext> = inner.pending.drain(..).collect();
            let in_flight = inner.in_flight;
            inner.in_flight = 0;
            inner.pending_no_cb = 0;
            (pending, in_flight)
        };
        self.release_unacked(conn, conn_type, pending, in_flight);
    }

    fn release_unacked(
        &self,
        conn: &ConnRef,
        conn_type: ConnType,
        pending: Vec<TxContext>,
        in_flight: usize,
    ) {
        if !pending.is_empty() || in_flight > 0 {
            debug!(
                "conn 0x{:04x}: releasing {} unacked frames, {} tracked",
                conn.handle(),
                in_flight,
                pending.len()
            );
        }

        let _scope = CompletionScope::enter();
        for ctx in pending {
            // The frame left the host, it is reported as sent
            self.complete_tx(conn, ctx, Ok(()));
        }
        if in_flight > 0 {
            self.give_credits(conn_type, in_flight);
        }
    }

    fn enter_disconnected(&self, conn: &ConnRef, conn_type: ConnType, old: ConnState) {
        let was_up = matches!(
            old,
            ConnState::Connected | ConnState::Disconnect | ConnState::DisconnectComplete
        );
        let err = conn.lock().err;

        if matches!(conn_type, ConnType::Sco | ConnType::Iso) {
            let unsent = drain_unsent(&mut conn.lock());
            self.fail_unsent(conn, unsent);
        }

        match conn_type {
            ConnType::Sco => {
                if was_up {
                    self.observers.notify(|o| o.disconnected(conn, err));
                } else if err != 0 {
                    self.observers.notify(|o| o.connected(conn, err));
                }
                self.release_slot(conn);
            }
            ConnType::Iso => {
                if let Some(iso) = self.iso() {
                    iso.disconnected(conn, err);
                }
                self.release_slot(conn);
            }
            ConnType::Br | ConnType::Le if was_up => {
                for child in self.table.children_of(conn.index()) {
                    if child.state() != ConnState::Disconnected {
                        child.lock().err = err;
                        self.set_state(&child, ConnState::Disconnected);
                    }
                }
                // Queued data and observers are handled outside the event path
                conn.lock().flags.insert(ConnFlags::CLEANUP_PENDING);
                self.wake_work();
            }
            ConnType::Br | ConnType::Le => {
                let notify = err != 0
                    && matches!(
                        old,
                        ConnState::Connect | ConnState::ConnectScan | ConnState::ConnectDirAdv
                    );
                if notify {
                    info!("{:?} connection failed: 0x{:02x}", conn_type, err);
                    self.observers.notify(|o| o.connected(conn, err));
                }
                self.release_slot(conn);
            }
        }
    }

    /// Complete buffers that never reached the controller with `NotConnected`
    fn fail_unsent(&self, conn: &ConnRef, unsent: Vec<Option<TxContext>>) {
        if unsent.is_empty() {
            return;
        }
        debug!("conn 0x{:04x}: dropping {} queued buffers", conn.handle(), unsent.len());
        let _scope = CompletionScope::enter();
        for ctx in unsent.into_iter().flatten() {
            self.complete_tx(conn, ctx, Err(ConnError::NotConnected));
        }
    }

    fn release_slot(&self, conn: &ConnRef) {
        let guard = conn.lock().lifecycle.take();
        drop(guard);
    }

    /// Final teardown of a disconnected ACL link
    fn conn_cleanup(&self, conn: &ConnRef) {
        let (queued, pending, in_flight, auto_connect, err) = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Disconnected {
                return;
            }
            inner.flags.remove(ConnFlags::CLEANUP_PENDING);
            let queued = drain_unsent(&mut inner);
            let pending: Vec<TxContext> = inner.pending.drain(..).collect();
            let in_flight = inner.in_flight;
            inner.in_flight = 0;
            inner.pending_no_cb = 0;
            inner.rx.reset();
            inner.timers = ConnTimers::default();
            inner.flags.remove(
                ConnFlags::PARAM_UPDATE_PENDING
                    | ConnFlags::PARAM_UPDATE_DONE
                    | ConnFlags::WAIT_PKT_CREDIT
                    | ConnFlags::REMOTE_INFO
                    | ConnFlags::ENCRYPT_PENDING,
            );
            let auto_connect =
                inner.conn_type == ConnType::Le && inner.flags.contains(ConnFlags::AUTO_CONNECT);
            (queued, pending, in_flight, auto_connect, inner.err)
        };

        if !pending.is_empty() || in_flight > 0 {
            warn!("conn 0x{:04x}: frames still in flight at cleanup", conn.handle());
            self.release_unacked(conn, conn.conn_type(), pending, in_flight);
        }
        self.fail_unsent(conn, queued);

        info!("conn 0x{:04x} disconnected, reason 0x{:02x}", conn.handle(), err);
        if let Some(upper) = self.upper_layer() {
            upper.disconnected(conn);
        }
        self.observers.notify(|o| o.disconnected(conn, err));

        self.release_slot(conn);
        if auto_connect {
            conn.lock().err = 0;
            self.set_state(conn, ConnState::ConnectScan);
        }
    }

    // ----- processing pass -----

    /// One processing pass at the current time
    pub fn process(&self) -> Option<Instant> {
        self.process_at(Instant::now())
    }

    /// One processing pass, timers compared against `now`
    ///
    /// Returns the next timer deadline, if any.
    pub fn process_at(&self, now: Instant) -> Option<Instant> {
        self.work.lock().unwrap().pending = false;

        for conn in self.table.collect(ConnTypeMask::ACL) {
            let cleanup = conn.lock().flags.contains(ConnFlags::CLEANUP_PENDING);
            if cleanup {
                self.conn_cleanup(&conn);
            }
        }

        let conns = self.table.collect(ConnTypeMask::ALL);
        for conn in &conns {
            self.run_timers(conn, now);
        }
        for conn in &conns {
            self.process_tx(conn);
        }

        conns
            .iter()
            .filter_map(|conn| conn.lock().timers.next_deadline())
            .min()
    }

    fn run_timers(&self, conn: &ConnRef, now: Instant) {
        let expired = |timer: &mut Option<Instant>| {
            if timer.is_some_and(|at| at <= now) {
                *timer = None;
                true
            } else {
                false
            }
        };
        let (conn_timeout, param_update, data_rate) = {
            let mut inner = conn.lock();
            (
                expired(&mut inner.timers.conn_timeout),
                expired(&mut inner.timers.param_update),
                expired(&mut inner.timers.data_rate),
            )
        };

        if conn_timeout {
            self.create_conn_timeout(conn);
        }
        if param_update {
            self.param_update_timeout(conn);
        }
        if data_rate {
            self.report_data_rate(conn, now);
        }
    }

    fn create_conn_timeout(&self, conn: &ConnRef) {
        {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connect || inner.conn_type != ConnType::Le {
                return;
            }
            inner.flags.insert(ConnFlags::CONN_TIMEOUT);
        }
        info!("LE create connection timed out, cancelling");

        // The controller answers with a failed LE Connection Complete
        if let Err(err) = self.send_command(HciCommand::LeCreateConnectionCancel) {
            conn.lock().err = err.hci_status();
            self.set_state(conn, ConnState::Disconnected);
        }
    }

    fn param_update_timeout(&self, conn: &ConnRef) {
        let params = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected || inner.role != Role::Slave {
                return;
            }
            inner.flags.insert(ConnFlags::PARAM_UPDATE_DONE);
            let requested = inner.flags.contains(ConnFlags::PARAM_UPDATE_PENDING);
            inner.flags.remove(ConnFlags::PARAM_UPDATE_PENDING);
            match inner.le() {
                Some(le) if requested => le.pending_params,
                Some(_) => self.config.peripheral_pref,
                None => return,
            }
        };

        debug!(
            "conn 0x{:04x}: requesting interval {}-{} latency {} timeout {}",
            conn.handle(),
            params.interval_min,
            params.interval_max,
            params.latency,
            params.timeout
        );
        if let Err(err) = self.send_conn_le_param_update(conn, &params) {
            warn!("conn 0x{:04x}: parameter update failed: {}", conn.handle(), err);
        }
    }

    fn report_data_rate(&self, conn: &ConnRef, now: Instant) {
        let Some(interval) = self.config.data_rate_interval else {
            return;
        };
        let mut inner = conn.lock();
        if inner.state != ConnState::Connected {
            return;
        }
        let secs = interval.as_secs_f64().max(0.001);
        info!(
            "conn 0x{:04x}: tx {:.0} B/s, rx {:.0} B/s",
            inner.handle,
            inner.stats.tx_bytes as f64 / secs,
            inner.stats.rx_bytes as f64 / secs
        );
        inner.stats = DataRate::default();
        inner.timers.data_rate = Some(now + interval);
    }

    /// Send what `conn` has queued until its queue is empty or its credit
    /// pool runs dry
    ///
    /// Never waits for credits. A buffer cut short is parked on the link and
    /// picked up again on the pass that follows the next give.
    fn process_tx(&self, conn: &ConnRef) {
        let conn_type = conn.conn_type();
        loop {
            let next = {
                let mut inner = conn.lock();
                if inner.state != ConnState::Connected {
                    return;
                }
                match inner.tx_current.take() {
                    Some(current) => NextTx::Resume(current),
                    None => match inner.tx_queue.pop_front() {
                        Some(item) => NextTx::Fresh(item),
                        None => return,
                    },
                }
            };

            self.wake_from_sniff(conn);
            let current = match next {
                NextTx::Resume(current) => current,
                NextTx::Fresh(TxItem { buf, ctx }) if conn_type == ConnType::Sco => {
                    if let Err((err, ctx)) = self.send_sco(conn, buf, ctx) {
                        self.tx_failed(conn, err, ctx);
                    }
                    continue;
                }
                NextTx::Fresh(TxItem { buf, ctx }) => TxInProgress {
                    frags: Fragmenter::new(buf, self.mtu(conn_type)),
                    ctx,
                },
            };

            match self.send_item(conn, conn_type, current) {
                Ok(true) => {}
                Ok(false) => {
                    trace!("conn 0x{:04x}: out of credits", conn.handle());
                    return;
                }
                Err((err, ctx)) => self.tx_failed(conn, err, ctx),
            }
        }
    }

    fn tx_failed(&self, conn: &ConnRef, err: ConnError, ctx: Option<TxContext>) {
        warn!("conn 0x{:04x}: unable to send: {}", conn.handle(), err);
        if let Some(ctx) = ctx {
            let _scope = CompletionScope::enter();
            self.complete_tx(conn, ctx, Err(err));
        }
    }

    /// Data is about to go out on a BR/EDR link parked in sniff
    fn wake_from_sniff(&self, conn: &ConnRef) {
        let sniffing = {
            let inner = conn.lock();
            inner.conn_type == ConnType::Br && inner.sniff.mode == BtMode::Sniff
        };
        if sniffing {
            if let Err(err) = self.sniff_exit(conn) {
                trace!("conn 0x{:04x}: no sniff exit: {}", conn.handle(), err);
            }
        }
    }

    /// Send the remaining fragments of one queued buffer
    ///
    /// Only the last fragment carries the context. `Ok(false)` means the
    /// credits ran out and the buffer is parked in `tx_current`. On failure
    /// the context, if it was not handed over yet, comes back with the error.
    fn send_item(
        &self,
        conn: &ConnRef,
        conn_type: ConnType,
        mut current: TxInProgress,
    ) -> Result<bool, (ConnError, Option<TxContext>)> {
        while !current.frags.is_done() {
            match self.flow.try_take(conn) {
                Ok(true) => {}
                Ok(false) => {
                    let mut inner = conn.lock();
                    if inner.state != ConnState::Connected {
                        return Err((ConnError::NotConnected, current.ctx));
                    }
                    inner.tx_current = Some(current);
                    return Ok(false);
                }
                Err(err) => return Err((err, current.ctx)),
            }

            let frag = match current.frags.next_fragment(&self.frag_pool) {
                Ok(Some(frag)) => frag,
                Ok(None) => {
                    self.give_credits(conn_type, 1);
                    break;
                }
                Err(err) => {
                    self.give_credits(conn_type, 1);
                    return Err((err, current.ctx));
                }
            };
            let frag_ctx = if current.frags.is_done() {
                current.ctx.take()
            } else {
                None
            };
            if let Err((err, returned)) = self.send_frag(conn, conn_type, frag, frag_ctx) {
                return Err((err, returned.or(current.ctx)));
            }
        }
        Ok(true)
    }

    /// SCO frames bypass flow control and complete once handed over
    fn send_sco(
        &self,
        conn: &ConnRef,
        buf: NetBuf,
        ctx: Option<TxContext>,
    ) -> Result<(), (ConnError, Option<TxContext>)> {
        let len = buf.len();
        if len > self.config.sco_mtu || len > u8::MAX as usize {
            return Err((
                ConnError::InvalidParameter(format!("SCO frame of {} bytes", len)),
                ctx,
            ));
        }

        let handle = conn.handle();
        let header = ScoHeader::new(handle, len as u8).to_bytes();
        let mut frame = Vec::with_capacity(header.len() + len);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(buf.as_slice());

        trace!("conn 0x{:04x} sco tx {}", handle, hex::encode(&frame));
        match self.transport.send_data(PacketKind::Sco, &frame) {
            Ok(()) => {
                conn.lock().stats.tx_bytes += len as u64;
                if let Some(ctx) = ctx {
                    let _scope = CompletionScope::enter();
                    self.complete_tx(conn, ctx, Ok(()));
                }
                Ok(())
            }
            Err(err) => Err((ConnError::Transport(err), ctx)),
        }
    }

    /// Return credits, scheduling a pass if a link was waiting for them
    fn give_credits(&self, conn_type: ConnType, count: usize) {
        if let Some(pool) = self.flow.pool_for(conn_type) {
            if self.flow.give(pool, count, &self.table) {
                self.wake_work();
            }
        }
    }

    /// Retire `ctx`, then run its callback
    fn complete_tx(&self, conn: &ConnRef, mut ctx: TxContext, result: ConnResult<()>) {
        let cb = ctx.take_callback();
        self.tx_pool.retire(ctx);
        if let Some(cb) = cb {
            cb(conn, result);
        }
    }

    // ----- outbound data -----

    /// Queue `buf` for transmission on `conn`
    ///
    /// The buffer goes out on the next processing pass. `cb` runs once the
    /// controller reports the last fragment as completed, or with an error
    /// if the buffer never made it out. Waits for a free TX context when
    /// a callback is given, except from within a completion callback.
    pub fn send(&self, conn: &ConnRef, buf: NetBuf, cb: Option<TxCallback>) -> ConnResult<()> {
        let conn_type = {
            let inner = conn.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            inner.conn_type
        };
        if conn_type == ConnType::Sco && buf.len() > self.config.sco_mtu.min(u8::MAX as usize) {
            return Err(ConnError::InvalidParameter(format!(
                "SCO frame of {} bytes exceeds MTU {}",
                buf.len(),
                self.config.sco_mtu
            )));
        }

        let ctx = match cb {
            Some(cb) => {
                let mut ctx = self.tx_pool.acquire(true)?;
                ctx.set_callback(cb);
                Some(ctx)
            }
            None => None,
        };

        {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected {
                drop(inner);
                if let Some(ctx) = ctx {
                    self.tx_pool.retire(ctx);
                }
                return Err(ConnError::NotConnected);
            }
            trace!("conn 0x{:04x}: queued {} bytes", inner.handle, buf.len());
            inner.tx_queue.push_back(TxItem { buf, ctx });
        }
        self.wake_work();
        Ok(())
    }

    // ----- controller feed -----

    /// Entry point for everything read from the controller
    pub fn handle_packet(&self, packet: HciPacket) {
        match packet {
            HciPacket::Event(event) => self.handle_event(&event),
            HciPacket::Acl(frame) => self.recv_acl(&frame),
            HciPacket::Sco(frame) => self.recv_sco(&frame),
            HciPacket::Iso(frame) => self.recv_iso(&frame),
        }
    }

    pub fn handle_event(&self, event: &HciEvent) {
        match ControllerEvent::parse(event) {
            Some(event) => self.handle_controller_event(event),
            None => trace!("Ignoring event 0x{:02x}", event.event_code),
        }
    }

    pub fn handle_controller_event(&self, event: ControllerEvent) {
        trace!("Controller event {:?}", event);
        match event {
            ControllerEvent::ConnectionComplete(evt) => self.on_conn_complete(evt),
            ControllerEvent::ConnectionRequest {
                bd_addr, link_type, ..
            } => self.on_conn_request(bd_addr, link_type),
            ControllerEvent::DisconnectionComplete {
                status,
                handle,
                reason,
            } => self.on_disconn_complete(status, handle, reason),
            ControllerEvent::EncryptionChange {
                status,
                handle,
                enabled,
            } => self.on_encrypt_change(status, handle, enabled),
            ControllerEvent::RemoteFeatures {
                status,
                handle,
                features,
            }
            | ControllerEvent::LeRemoteFeatures {
                status,
                handle,
                features,
            } => self.on_remote_features(status, handle, features),
            ControllerEvent::RoleChange {
                status,
                bd_addr,
                role,
            } => self.on_role_change(status, bd_addr, role),
            ControllerEvent::NumberOfCompletedPackets(entries) => self.on_completed_packets(&entries),
            ControllerEvent::ModeChange {
                status,
                handle,
                mode,
                interval,
            } => self.on_mode_change(status, handle, mode, interval),
            ControllerEvent::SyncConnectionComplete(evt) => self.on_sync_conn_complete(evt),
            ControllerEvent::LeConnectionComplete(evt) => self.on_le_conn_complete(evt),
            ControllerEvent::LeConnectionUpdateComplete {
                status,
                handle,
                interval,
                latency,
                timeout,
            } => self.on_le_conn_update_complete(status, handle, interval, latency, timeout),
            ControllerEvent::LeDataLengthChange {
                handle,
                max_tx_octets,
                max_tx_time,
                max_rx_octets,
                max_rx_time,
            } => self.on_le_data_len_change(
                handle,
                DataLenInfo {
                    tx_max_len: max_tx_octets,
                    tx_max_time: max_tx_time,
                    rx_max_len: max_rx_octets,
                    rx_max_time: max_rx_time,
                },
            ),
            ControllerEvent::LePhyUpdateComplete {
                status,
                handle,
                tx_phy,
                rx_phy,
            } => self.on_le_phy_update(status, handle, PhyInfo { tx_phy, rx_phy }),
        }
    }

    /// Number Of Completed Packets: retire tracked frames, return credits
    fn on_completed_packets(&self, entries: &[CompletedPackets]) {
        let _scope = CompletionScope::enter();

        for entry in entries {
            let Some(conn) = self.table.lookup_handle(entry.handle) else {
                warn!("No connection for completed handle 0x{:04x}", entry.handle);
                continue;
            };
            let conn_type = conn.conn_type();
            if conn_type == ConnType::Sco {
                continue;
            }

            for _ in 0..entry.count {
                let ctx = {
                    let mut inner = conn.lock();
                    if inner.in_flight == 0 {
                        warn!("conn 0x{:04x}: completion without frame in flight", inner.handle);
                    }
                    inner.in_flight = inner.in_flight.saturating_sub(1);
                    if inner.pending_no_cb > 0 {
                        inner.pending_no_cb -= 1;
                        None
                    } else {
                        match inner.pending.pop_front() {
                            Some(mut ctx) => {
                                // Frames sent after this one now count on the link
                                inner.pending_no_cb = ctx.pending_no_cb;
                                ctx.pending_no_cb = 0;
                                Some(ctx)
                            }
                            None => None,
                        }
                    }
                };
                if let Some(ctx) = ctx {
                    self.complete_tx(&conn, ctx, Ok(()));
                }
            }

            self.give_credits(conn_type, entry.count as usize);
        }
    }

    fn on_conn_complete(&self, evt: ConnectionComplete) {
        let conn_type = match evt.link_type {
            LINK_TYPE_ACL => ConnType::Br,
            LINK_TYPE_SCO | LINK_TYPE_ESCO => ConnType::Sco,
            other => {
                warn!("Connection complete for unknown link type 0x{:02x}", other);
                return;
            }
        };
        let peer = LeAddr::public(evt.bd_addr.bytes);
        let Some(conn) = self
            .table
            .lookup_state(conn_type, Some(&peer), ConnState::Connect)
        else {
            warn!("No pending {:?} connection for {}", conn_type, evt.bd_addr);
            return;
        };

        if evt.status != HCI_SUCCESS {
            conn.lock().err = evt.status;
            self.set_state(&conn, ConnState::Disconnected);
            return;
        }

        {
            let mut inner = conn.lock();
            inner.handle = evt.handle;
            if evt.encryption_enabled {
                inner.sec_level = SecurityLevel::Medium;
            }
        }
        self.set_state(&conn, ConnState::Connected);
    }

    fn on_sync_conn_complete(&self, evt: SyncConnectionComplete) {
        let peer = LeAddr::public(evt.bd_addr.bytes);
        let Some(conn) = self
            .table
            .lookup_state(ConnType::Sco, Some(&peer), ConnState::Connect)
        else {
            warn!("No pending SCO connection for {}", evt.bd_addr);
            return;
        };

        if evt.status != HCI_SUCCESS {
            conn.lock().err = evt.status;
            self.set_state(&conn, ConnState::Disconnected);
            return;
        }

        {
            let mut inner = conn.lock();
            inner.handle = evt.handle;
            if let LinkParams::Sco(sco) = &mut inner.link {
                sco.air_mode = evt.air_mode;
            }
        }
        self.set_state(&conn, ConnState::Connected);
    }

    fn on_conn_request(&self, bd_addr: BdAddr, link_type: u8) {
        if !self.observers.connect_req(&bd_addr) {
            info!("Rejecting connection request from {}", bd_addr);
            self.reject_conn(bd_addr, HCI_ERR_REJ_BAD_ADDR);
            return;
        }

        let conn_type = if link_type == LINK_TYPE_ACL {
            ConnType::Br
        } else {
            ConnType::Sco
        };
        let parent = match conn_type {
            ConnType::Sco => self.lookup_addr_br(&bd_addr).map(|acl| acl.index()),
            _ => None,
        };
        let conn = match self.table.allocate(conn_type) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Unable to accept {}: {}", bd_addr, err);
                self.reject_conn(bd_addr, HCI_ERR_INSUFFICIENT_RESOURCES);
                return;
            }
        };

        {
            let mut inner = conn.lock();
            inner.role = Role::Slave;
            inner.parent = parent;
            inner.link = match conn_type {
                ConnType::Sco => LinkParams::new_sco(bd_addr, ESCO_PKT_DEFAULT),
                _ => LinkParams::new_br(bd_addr),
            };
        }
        self.set_state(&conn, ConnState::Connect);

        let accept = HciCommand::AcceptConnectionRequest {
            bd_addr,
            role: HCI_ROLE_SLAVE,
        };
        if let Err(err) = self.send_command(accept) {
            conn.lock().err = err.hci_status();
            self.set_state(&conn, ConnState::Disconnected);
        }
    }

    fn reject_conn(&self, bd_addr: BdAddr, reason: u8) {
        if let Err(err) = self.send_command(HciCommand::RejectConnectionRequest { bd_addr, reason }) {
            debug!("Connection request from {} left unanswered: {}", bd_addr, err);
        }
    }

    fn on_disconn_complete(&self, status: u8, handle: u16, reason: u8) {
        if status != HCI_SUCCESS {
            warn!("Disconnection of 0x{:04x} failed: 0x{:02x}", handle, status);
            return;
        }
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };

        conn.lock().err = reason;
        self.set_state(&conn, ConnState::DisconnectComplete);
        self.set_state(&conn, ConnState::Disconnected);
    }

    /// Level reached once `conn` is encrypted, judged by the stored key
    fn encrypted_level(&self, conn: &ConnRef) -> SecurityLevel {
        let (id, link) = {
            let inner = conn.lock();
            (inner.id, inner.link.clone())
        };
        let Some(keys) = self.key_store() else {
            return SecurityLevel::Medium;
        };
        match link {
            LinkParams::Le(le) => keys
                .le_ltk(id, &le.dst)
                .map(|ltk| ltk.level())
                .unwrap_or(SecurityLevel::Medium),
            LinkParams::Br(br) => match keys.br_key_authenticated(&br.dst) {
                Some(true) => SecurityLevel::High,
                _ => SecurityLevel::Medium,
            },
            _ => SecurityLevel::Medium,
        }
    }

    fn on_encrypt_change(&self, status: u8, handle: u16, enabled: bool) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };

        let level = if status == HCI_SUCCESS && enabled {
            self.encrypted_level(&conn)
        } else {
            SecurityLevel::Low
        };
        let (level, err) = {
            let mut inner = conn.lock();
            inner.flags.remove(ConnFlags::ENCRYPT_PENDING);
            if status != HCI_SUCCESS {
                (inner.sec_level, status)
            } else {
                inner.sec_level = level;
                let err = if level < inner.required_sec_level {
                    HCI_ERR_AUTH_FAIL
                } else {
                    HCI_SUCCESS
                };
                (level, err)
            }
        };

        info!(
            "conn 0x{:04x}: security {:?}, status 0x{:02x}",
            handle, level, err
        );
        if status == HCI_SUCCESS {
            if let Some(keys) = self.key_store() {
                keys.security_changed(&conn.info(), level);
            }
        }
        self.observers
            .notify(|o| o.security_changed(&conn, level, err));
    }

    fn on_remote_features(&self, status: u8, handle: u16, features: [u8; 8]) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };
        if status != HCI_SUCCESS {
            warn!("conn 0x{:04x}: reading remote features failed: 0x{:02x}", handle, status);
            return;
        }

        let conn_type = {
            let mut inner = conn.lock();
            match &mut inner.link {
                LinkParams::Le(le) => le.features = features,
                LinkParams::Br(br) => br.features = features,
                _ => return,
            }
            inner.flags.insert(ConnFlags::REMOTE_INFO);
            inner.conn_type
        };

        let info = RemoteInfo {
            conn_type,
            features,
        };
        self.observers
            .notify(|o| o.remote_info_available(&conn, &info));
    }

    fn on_role_change(&self, status: u8, bd_addr: BdAddr, role: u8) {
        if status != HCI_SUCCESS {
            debug!("Role change for {} failed: 0x{:02x}", bd_addr, status);
            return;
        }
        let Some(conn) = self.lookup_addr_br(&bd_addr) else {
            warn!("Role change for unknown peer {}", bd_addr);
            return;
        };

        let role = Role::from(role);
        conn.lock().role = role;
        self.observers.notify(|o| o.role_changed(&conn, role));
    }

    fn on_mode_change(&self, status: u8, handle: u16, mode: u8, interval: u16) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };
        let mode = if mode == HCI_MODE_SNIFF {
            BtMode::Sniff
        } else {
            BtMode::Active
        };

        {
            let mut inner = conn.lock();
            if status != HCI_SUCCESS {
                let current = inner.sniff.mode;
                inner.sniff.mode_changed(current);
                warn!("conn 0x{:04x}: mode change failed: 0x{:02x}", handle, status);
                return;
            }
            inner.sniff.mode_changed(mode);
            match inner.br_mut() {
                Some(br) => {
                    br.mode = mode;
                    br.sniff_interval = interval;
                }
                None => return,
            }
        }

        debug!("conn 0x{:04x}: mode {:?} interval {}", handle, mode, interval);
        self.observers
            .notify(|o| o.mode_changed(&conn, mode, interval));
    }

    fn on_le_conn_complete(&self, evt: LeConnectionComplete) {
        if evt.status != HCI_SUCCESS {
            let state = if evt.status == HCI_ERR_ADV_TIMEOUT {
                ConnState::ConnectDirAdv
            } else {
                ConnState::Connect
            };
            let Some(conn) = self.table.lookup_state(ConnType::Le, None, state) else {
                warn!("LE connection failed (0x{:02x}) with nothing pending", evt.status);
                return;
            };
            let timed_out = {
                let mut inner = conn.lock();
                inner.err = evt.status;
                inner.flags.contains(ConnFlags::CONN_TIMEOUT)
            };
            if timed_out {
                info!("LE connection attempt timed out");
            }
            self.set_state(&conn, ConnState::Disconnected);
            return;
        }

        let role = Role::from(evt.role);
        let found = match role {
            Role::Master => self
                .table
                .lookup_state(ConnType::Le, Some(&evt.peer), ConnState::Connect)
                .or_else(|| self.table.lookup_state(ConnType::Le, None, ConnState::Connect)),
            Role::Slave => self
                .table
                .lookup_state(ConnType::Le, Some(&evt.peer), ConnState::ConnectDirAdv)
                .or_else(|| {
                    self.table
                        .lookup_state(ConnType::Le, None, ConnState::ConnectAdv)
                }),
        };
        let conn = match found {
            Some(conn) => conn,
            None if role == Role::Slave => match self.table.allocate(ConnType::Le) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("No slot for LE connection from {}: {}", evt.peer, err);
                    let command = HciCommand::Disconnect {
                        handle: evt.handle,
                        reason: HCI_ERR_REMOTE_LOW_RESOURCES,
                    };
                    if let Err(err) = self.send_command(command) {
                        debug!("Unable to drop handle 0x{:04x}: {}", evt.handle, err);
                    }
                    return;
                }
            },
            None => {
                warn!("No pending LE connection for {}", evt.peer);
                return;
            }
        };

        let on_air_peer = match evt.peer_rpa {
            Some(rpa) if rpa != BdAddr::ANY => LeAddr::random(rpa.bytes),
            _ => evt.peer,
        };
        let local = match evt.local_rpa {
            Some(rpa) if rpa != BdAddr::ANY => LeAddr::random(rpa.bytes),
            _ => LeAddr::NONE,
        };

        {
            let mut inner = conn.lock();
            inner.handle = evt.handle;
            inner.role = role;
            inner.err = 0;
            inner.flags.remove(ConnFlags::CONN_TIMEOUT);
            if let Some(le) = inner.le_mut() {
                le.dst = evt.peer;
                match role {
                    Role::Master => {
                        le.init_addr = local;
                        le.resp_addr = on_air_peer;
                    }
                    Role::Slave => {
                        le.init_addr = on_air_peer;
                        le.resp_addr = local;
                    }
                }
                le.interval = evt.interval;
                le.latency = evt.latency;
                le.timeout = evt.timeout;
            }
        }
        self.set_state(&conn, ConnState::Connected);
    }

    fn on_le_conn_update_complete(
        &self,
        status: u8,
        handle: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };

        let fallback = {
            let mut inner = conn.lock();
            let role = inner.role;
            let Some(le) = inner.le_mut() else {
                return;
            };
            if status == HCI_SUCCESS {
                le.interval = interval;
                le.latency = latency;
                le.timeout = timeout;
            }
            let pending = le.pending_params;
            inner.flags.remove(ConnFlags::PARAM_UPDATE_PENDING);
            (status == HCI_ERR_UNSUPP_REMOTE_FEATURE && role == Role::Slave).then_some(pending)
        };

        // The central lacks the procedure, ask over the signalling channel
        if let Some(params) = fallback {
            if let Some(upper) = self.upper_layer() {
                if let Err(err) = upper.le_param_update_request(&conn, &params) {
                    warn!("conn 0x{:04x}: parameter request failed: {}", handle, err);
                }
                return;
            }
        }

        self.observers
            .notify(|o| o.le_param_updated(&conn, interval, latency, timeout, status));
    }

    fn on_le_data_len_change(&self, handle: u16, info: DataLenInfo) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };
        if let Some(le) = conn.lock().le_mut() {
            le.data_len = info;
        }
        debug!(
            "conn 0x{:04x}: data length tx {}/{} rx {}/{}",
            handle, info.tx_max_len, info.tx_max_time, info.rx_max_len, info.rx_max_time
        );
        self.observers
            .notify(|o| o.le_data_len_updated(&conn, &info));
    }

    fn on_le_phy_update(&self, status: u8, handle: u16, phy: PhyInfo) {
        let Some(conn) = self.table.lookup_handle(handle) else {
            warn!("Unable to look up conn with handle 0x{:04x}", handle);
            return;
        };
        if status != HCI_SUCCESS {
            warn!("conn 0x{:04x}: PHY update failed: 0x{:02x}", handle, status);
            return;
        }
        if let Some(le) = conn.lock().le_mut() {
            le.phy = phy;
        }
        self.observers.notify(|o| o.le_phy_updated(&conn, &phy));
    }

    // ----- inbound data -----

    /// One ACL frame, header included
    pub fn recv_acl(&self, frame: &[u8]) {
        let Some(header) = AclHeader::parse(frame) else {
            warn!("Short ACL frame ({} bytes)", frame.len());
            return;
        };
        let payload = &frame[HCI_ACL_HDR_SIZE..];
        if payload.len() != header.length as usize {
            warn!(
                "ACL data length mismatch ({} != {})",
                payload.len(),
                header.length
            );
            return;
        }
        let Some(conn) = self.table.lookup_handle(header.handle) else {
            warn!("Unable to find conn for handle 0x{:04x}", header.handle);
            return;
        };
        trace!("conn 0x{:04x} rx {}", header.handle, hex::encode(payload));

        let outcome = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected || !inner.conn_type.is_acl() {
                debug!("conn 0x{:04x} not connected, dropping ACL", header.handle);
                return;
            }
            inner.stats.rx_bytes += payload.len() as u64;
            inner.rx.push(header.is_start(), payload, &self.rx_pool)
        };

        if let RxOutcome::Complete(pdu) = outcome {
            self.dispatch_pdu(&conn, pdu);
        }
    }

    fn dispatch_pdu(&self, conn: &ConnRef, pdu: NetBuf) {
        let Some(header) = L2capHeader::parse(pdu.as_slice()) else {
            return;
        };
        if header.channel_id == L2CAP_CID_CONNECTIONLESS {
            let data = &pdu.as_slice()[L2CAP_HDR_SIZE..];
            self.observers
                .notify(|o| o.rx_connectionless_data(conn, data));
            return;
        }
        match self.upper_layer() {
            Some(upper) => upper.recv(conn, pdu),
            None => debug!(
                "No upper layer, dropping PDU for CID 0x{:04x}",
                header.channel_id
            ),
        }
    }

    /// One SCO frame, header included
    pub fn recv_sco(&self, frame: &[u8]) {
        let Some(header) = ScoHeader::parse(frame) else {
            warn!("Short SCO frame ({} bytes)", frame.len());
            return;
        };
        let payload = &frame[HCI_SCO_HDR_SIZE..];
        let Some(data) = payload.get(..header.length as usize) else {
            warn!("SCO frame truncated ({} < {})", payload.len(), header.length);
            return;
        };
        let Some(conn) = self.table.lookup_handle(header.handle) else {
            warn!("Unable to find conn for handle 0x{:04x}", header.handle);
            return;
        };
        {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected || inner.conn_type != ConnType::Sco {
                return;
            }
            inner.stats.rx_bytes += data.len() as u64;
        }
        self.observers
            .notify(|o| o.rx_sco_data(&conn, data, header.status));
    }

    /// One ISO frame, header included
    pub fn recv_iso(&self, frame: &[u8]) {
        let Some(header) = IsoHeader::parse(frame) else {
            warn!("Short ISO frame ({} bytes)", frame.len());
            return;
        };
        let payload = &frame[HCI_ISO_HDR_SIZE..];
        let Some(data) = payload.get(..header.length as usize) else {
            warn!("ISO frame truncated ({} < {})", payload.len(), header.length);
            return;
        };
        let Some(conn) = self.table.lookup_handle(header.handle) else {
            warn!("Unable to find conn for handle 0x{:04x}", header.handle);
            return;
        };
        if conn.state() != ConnState::Connected || conn.conn_type() != ConnType::Iso {
            return;
        }
        match self.iso() {
            Some(iso) => iso.recv(&conn, header.boundary, data),
            None => debug!("No ISO handler, dropping frame"),
        }
    }

    // ----- connection API -----

    /// Initiate an LE connection to `peer`
    ///
    /// An existing connection or attempt towards the same peer is returned
    /// instead. Only one LE initiation may run at a time.
    pub fn connect_le(&self, peer: LeAddr, params: LeConnParams) -> ConnResult<ConnRef> {
        if !params.validate() {
            return Err(ConnError::InvalidParameter(
                "LE connection parameters out of range".into(),
            ));
        }

        if let Some(existing) = self.table.lookup_addr(ConnType::Le, 0, &peer) {
            match existing.state() {
                ConnState::Connect | ConnState::Connected => return Ok(existing),
                ConnState::ConnectScan => {
                    if let Some(le) = existing.lock().le_mut() {
                        le.pending_params = params;
                    }
                    return Ok(existing);
                }
                ConnState::Disconnected => {}
                _ => return Err(ConnError::Busy),
            }
        }
        if self
            .table
            .lookup_state(ConnType::Le, None, ConnState::Connect)
            .is_some()
        {
            return Err(ConnError::Busy);
        }

        let conn = self.table.allocate(ConnType::Le)?;
        {
            let mut inner = conn.lock();
            inner.role = Role::Master;
            inner.link = LinkParams::new_le(peer, params);
        }
        self.start_le_create_conn(&conn)?;
        Ok(conn)
    }

    fn start_le_create_conn(&self, conn: &ConnRef) -> ConnResult<()> {
        let Some((peer, params)) = conn.lock().le().map(|le| (le.dst, le.pending_params)) else {
            return Err(ConnError::NotSupported);
        };

        self.set_state(conn, ConnState::Connect);
        let command = HciCommand::LeCreateConnection {
            scan_interval: self.config.le_scan_interval,
            scan_window: self.config.le_scan_window,
            filter_policy: 0,
            peer,
            own_address_type: 0,
            interval_min: params.interval_min,
            interval_max: params.interval_max,
            latency: params.latency,
            timeout: params.timeout,
        };
        if let Err(err) = self.send_command(command) {
            conn.lock().err = err.hci_status();
            self.set_state(conn, ConnState::Disconnected);
            return Err(err);
        }
        Ok(())
    }

    /// Keep (re)connecting to `peer` whenever it is seen advertising
    pub fn connect_le_auto(&self, peer: LeAddr, params: LeConnParams) -> ConnResult<ConnRef> {
        if !params.validate() {
            return Err(ConnError::InvalidParameter(
                "LE connection parameters out of range".into(),
            ));
        }
        if let Some(existing) = self.table.lookup_addr(ConnType::Le, 0, &peer) {
            if existing.state() != ConnState::Disconnected {
                existing.lock().flags.insert(ConnFlags::AUTO_CONNECT);
                return Ok(existing);
            }
        }

        let conn = self.table.allocate(ConnType::Le)?;
        {
            let mut inner = conn.lock();
            inner.role = Role::Master;
            inner.link = LinkParams::new_le(peer, params);
            inner.flags.insert(ConnFlags::AUTO_CONNECT);
        }
        self.set_state(&conn, ConnState::ConnectScan);
        Ok(conn)
    }

    /// Advertising report from the scanner
    ///
    /// A connectable report from a peer we are waiting for starts the
    /// connection attempt.
    pub fn on_adv_report(&self, peer: &LeAddr, connectable: bool) {
        if !connectable {
            return;
        }
        let Some(conn) = self
            .table
            .lookup_state(ConnType::Le, Some(peer), ConnState::ConnectScan)
        else {
            return;
        };
        if self
            .table
            .lookup_state(ConnType::Le, None, ConnState::Connect)
            .is_some()
        {
            debug!("Initiator busy, {} stays queued", peer);
            return;
        }
        if let Err(err) = self.start_le_create_conn(&conn) {
            warn!("Connecting to {} failed: {}", peer, err);
        }
    }

    /// Start connectable advertising, directed when `peer` is given
    pub fn advertise_connectable(&self, peer: Option<LeAddr>) -> ConnResult<ConnRef> {
        let advertising = [ConnState::ConnectAdv, ConnState::ConnectDirAdv]
            .iter()
            .any(|state| self.table.lookup_state(ConnType::Le, None, *state).is_some());
        if advertising {
            return Err(ConnError::Busy);
        }

        let conn = self.table.allocate(ConnType::Le)?;
        {
            let mut inner = conn.lock();
            inner.role = Role::Slave;
            inner.link =
                LinkParams::new_le(peer.unwrap_or(LeAddr::NONE), self.config.peripheral_pref);
        }
        let state = if peer.is_some() {
            ConnState::ConnectDirAdv
        } else {
            ConnState::ConnectAdv
        };
        self.set_state(&conn, state);

        if let Err(err) = self.send_command(HciCommand::LeSetAdvertiseEnable { enable: true }) {
            conn.lock().err = err.hci_status();
            self.set_state(&conn, ConnState::Disconnected);
            return Err(err);
        }
        Ok(conn)
    }

    /// Page a BR/EDR peer
    pub fn connect_br(&self, peer: BdAddr) -> ConnResult<ConnRef> {
        if let Some(existing) = self.lookup_addr_br(&peer) {
            match existing.state() {
                ConnState::Connect | ConnState::Connected => return Ok(existing),
                ConnState::Disconnected => {}
                _ => return Err(ConnError::Busy),
            }
        }

        let conn = self.table.allocate(ConnType::Br)?;
        {
            let mut inner = conn.lock();
            inner.role = Role::Master;
            inner.link = LinkParams::new_br(peer);
        }
        self.set_state(&conn, ConnState::Connect);

        let command = HciCommand::CreateConnection {
            bd_addr: peer,
            packet_type: self.config.br_packet_type,
            page_scan_rep_mode: PAGE_SCAN_REP_MODE,
            clock_offset: 0,
            allow_role_switch: true,
        };
        if let Err(err) = self.send_command(command) {
            conn.lock().err = err.hci_status();
            self.set_state(&conn, ConnState::Disconnected);
            return Err(err);
        }
        Ok(conn)
    }

    /// Set up a synchronous link on top of a connected BR/EDR link
    pub fn connect_sco(&self, acl: &ConnRef) -> ConnResult<ConnRef> {
        let (acl_handle, dst, packet_type) = {
            let inner = acl.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            let Some(br) = inner.br() else {
                return Err(ConnError::NotSupported);
            };
            let packet_type = match br.esco_packet_type {
                0 => ESCO_PKT_DEFAULT,
                other => other,
            };
            (inner.handle, br.dst, packet_type)
        };

        let conn = self.table.allocate(ConnType::Sco)?;
        {
            let mut inner = conn.lock();
            inner.role = Role::Master;
            inner.link = LinkParams::new_sco(dst, packet_type);
            inner.parent = Some(acl.index());
        }
        self.set_state(&conn, ConnState::Connect);

        let command = HciCommand::SetupSyncConnection {
            handle: acl_handle,
            tx_bandwidth: SCO_BANDWIDTH,
            rx_bandwidth: SCO_BANDWIDTH,
            max_latency: SCO_MAX_LATENCY,
            voice_setting: VOICE_SETTING_DEFAULT,
            retrans_effort: 0x01,
            packet_type,
        };
        if let Err(err) = self.send_command(command) {
            conn.lock().err = err.hci_status();
            self.set_state(&conn, ConnState::Disconnected);
            return Err(err);
        }
        Ok(conn)
    }

    /// Register an isochronous channel the controller set up on `acl`
    pub fn add_iso(&self, acl: &ConnRef, handle: u16) -> ConnResult<ConnRef> {
        let role = {
            let inner = acl.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            if inner.conn_type != ConnType::Le {
                return Err(ConnError::NotSupported);
            }
            inner.role
        };

        let conn = self.table.allocate(ConnType::Iso)?;
        {
            let mut inner = conn.lock();
            inner.handle = handle;
            inner.role = role;
            inner.link = LinkParams::new_iso(acl.handle());
            inner.parent = Some(acl.index());
        }
        self.set_state(&conn, ConnState::Connect);
        self.set_state(&conn, ConnState::Connected);
        Ok(conn)
    }

    /// Tear down `conn` or abandon the attempt to establish it
    pub fn disconnect(&self, conn: &ConnRef, reason: u8) -> ConnResult<()> {
        let (state, conn_type, role, handle, br_peer) = {
            let mut inner = conn.lock();
            // A local disconnect ends automatic reconnection
            inner.flags.remove(ConnFlags::AUTO_CONNECT);
            (
                inner.state,
                inner.conn_type,
                inner.role,
                inner.handle,
                inner.br().map(|br| br.dst),
            )
        };

        match state {
            ConnState::ConnectScan | ConnState::ConnectAuto => {
                conn.lock().err = reason;
                self.set_state(conn, ConnState::Disconnected);
                Ok(())
            }
            ConnState::ConnectAdv | ConnState::ConnectDirAdv => {
                conn.lock().err = reason;
                self.set_state(conn, ConnState::Disconnected);
                self.send_command(HciCommand::LeSetAdvertiseEnable { enable: false })
            }
            ConnState::Connect => {
                let cancel = match (conn_type, br_peer) {
                    (ConnType::Le, _) => Some(HciCommand::LeCreateConnectionCancel),
                    (ConnType::Br, Some(bd_addr)) if role == Role::Master => {
                        Some(HciCommand::CreateConnectionCancel { bd_addr })
                    }
                    _ => None,
                };
                let result = match cancel {
                    Some(command) => self.send_command(command),
                    None => Ok(()),
                };
                conn.lock().err = reason;
                self.set_state(conn, ConnState::Disconnected);
                result
            }
            ConnState::Connected => {
                self.send_command(HciCommand::Disconnect { handle, reason })?;
                // Disconnection Complete may already have been handled
                self.set_state_from(conn, ConnState::Connected, ConnState::Disconnect);
                Ok(())
            }
            ConnState::Disconnect | ConnState::DisconnectComplete => Ok(()),
            ConnState::Disconnected => Err(ConnError::NotConnected),
        }
    }

    /// Disconnect every connection of the given types
    pub fn disconnect_all(&self, mask: ConnTypeMask, reason: u8) {
        for conn in self.table.collect(mask) {
            match self.disconnect(&conn, reason) {
                Ok(()) | Err(ConnError::NotConnected) => {}
                Err(err) => warn!("conn 0x{:04x}: disconnect failed: {}", conn.handle(), err),
            }
        }
    }

    /// Raise the security of `conn` to at least `level`
    ///
    /// The outcome arrives through `security_changed`.
    pub fn set_security(&self, conn: &ConnRef, level: SecurityLevel) -> ConnResult<()> {
        let (conn_type, role, handle, id, previous) = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            if !inner.conn_type.is_acl() {
                return Err(ConnError::NotSupported);
            }
            if inner.sec_level >= level {
                return Ok(());
            }
            let previous = inner.required_sec_level;
            inner.required_sec_level = level;
            if inner.flags.contains(ConnFlags::ENCRYPT_PENDING) {
                return Ok(());
            }
            // Set ahead of the command, the change event may beat its return
            inner.flags.insert(ConnFlags::ENCRYPT_PENDING);
            (inner.conn_type, inner.role, inner.handle, inner.id, previous)
        };

        let result = match conn_type {
            ConnType::Br => self.send_command(HciCommand::AuthenticationRequested { handle }),
            ConnType::Le if role == Role::Master => {
                let peer = conn.lock().le().map(|le| le.dst);
                let ltk = peer.and_then(|peer| self.key_store()?.le_ltk(id, &peer));
                match ltk {
                    Some(key) if key.level() >= level => {
                        self.send_command(HciCommand::LeStartEncryption {
                            handle,
                            rand: key.rand,
                            ediv: key.ediv,
                            ltk: key.ltk,
                        })
                    }
                    _ => self.start_upper_security(conn, level),
                }
            }
            _ => self.start_upper_security(conn, level),
        };

        if result.is_err() {
            let mut inner = conn.lock();
            inner.flags.remove(ConnFlags::ENCRYPT_PENDING);
            inner.required_sec_level = previous;
        }
        result
    }

    fn start_upper_security(&self, conn: &ConnRef, level: SecurityLevel) -> ConnResult<()> {
        match self.upper_layer() {
            Some(upper) => upper.start_security(conn, level),
            None => Err(ConnError::NotSupported),
        }
    }

    /// Ask for new LE connection parameters
    ///
    /// As slave, a request made before the initial update timer fired is
    /// remembered and sent when it does.
    pub fn le_param_update(&self, conn: &ConnRef, params: &LeConnParams) -> ConnResult<()> {
        if !params.validate() {
            return Err(ConnError::InvalidParameter(
                "LE connection parameters out of range".into(),
            ));
        }

        {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            let role = inner.role;
            let update_done = inner.flags.contains(ConnFlags::PARAM_UPDATE_DONE);
            let Some(le) = inner.le_mut() else {
                return Err(ConnError::NotSupported);
            };
            let current = le.interval >= params.interval_min
                && le.interval <= params.interval_max
                && le.latency == params.latency
                && le.timeout == params.timeout;
            if current {
                return Err(ConnError::Already);
            }
            if role == Role::Slave && !update_done {
                le.pending_params = *params;
                inner.flags.insert(ConnFlags::PARAM_UPDATE_PENDING);
                return Ok(());
            }
        }

        self.send_conn_le_param_update(conn, params)
    }

    /// Send a parameter update over HCI when the link allows it, otherwise
    /// through the upper layer's signalling channel
    fn send_conn_le_param_update(&self, conn: &ConnRef, params: &LeConnParams) -> ConnResult<()> {
        let (role, handle, remote_supports) = {
            let inner = conn.lock();
            let Some(le) = inner.le() else {
                return Err(ConnError::NotSupported);
            };
            // Unknown features: assume the procedure is there
            let remote_supports = !inner.flags.contains(ConnFlags::REMOTE_INFO)
                || le.features[0] & LE_FEAT_CONN_PARAM_REQ != 0;
            (inner.role, inner.handle, remote_supports)
        };

        if role == Role::Master || (self.config.le_conn_param_req && remote_supports) {
            self.send_command(HciCommand::LeConnectionUpdate {
                handle,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            })?;
            if let Some(le) = conn.lock().le_mut() {
                le.pending_params = *params;
            }
            return Ok(());
        }

        match self.upper_layer() {
            Some(upper) => upper.le_param_update_request(conn, params),
            None => Err(ConnError::NotSupported),
        }
    }

    fn le_handle(&self, conn: &ConnRef) -> ConnResult<u16> {
        let inner = conn.lock();
        if inner.state != ConnState::Connected {
            return Err(ConnError::NotConnected);
        }
        if inner.conn_type != ConnType::Le {
            return Err(ConnError::NotSupported);
        }
        Ok(inner.handle)
    }

    pub fn le_data_len_update(&self, conn: &ConnRef, tx_octets: u16, tx_time: u16) -> ConnResult<()> {
        let handle = self.le_handle(conn)?;
        self.send_command(HciCommand::LeSetDataLength {
            handle,
            tx_octets,
            tx_time,
        })
    }

    /// Request PHYs, `tx_phys` and `rx_phys` are HCI preference bitmasks
    pub fn le_phy_update(&self, conn: &ConnRef, tx_phys: u8, rx_phys: u8) -> ConnResult<()> {
        let handle = self.le_handle(conn)?;
        self.send_command(HciCommand::LeSetPhy {
            handle,
            all_phys: 0,
            tx_phys,
            rx_phys,
            phy_options: 0,
        })
    }

    /// Put a BR/EDR link into sniff mode
    pub fn sniff_enter(&self, conn: &ConnRef, min_interval: u16, max_interval: u16) -> ConnResult<()> {
        let handle = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            if inner.conn_type != ConnType::Br {
                return Err(ConnError::NotSupported);
            }
            if !inner
                .sniff
                .request_entry(Instant::now(), self.config.sniff_timeout)?
            {
                return Ok(());
            }
            inner.handle
        };

        let command = HciCommand::SniffMode {
            handle,
            max_interval,
            min_interval,
            attempt: SNIFF_ATTEMPT,
            timeout: SNIFF_TIMEOUT,
        };
        if let Err(err) = self.send_command(command) {
            conn.lock().sniff.abort_entry();
            return Err(err);
        }
        Ok(())
    }

    /// Bring a BR/EDR link back to active mode
    pub fn sniff_exit(&self, conn: &ConnRef) -> ConnResult<()> {
        let handle = {
            let mut inner = conn.lock();
            if inner.state != ConnState::Connected {
                return Err(ConnError::NotConnected);
            }
            if inner.conn_type != ConnType::Br {
                return Err(ConnError::NotSupported);
            }
            inner
                .sniff
                .request_exit(Instant::now(), self.config.sniff_timeout)?;
            inner.handle
        };

        if let Err(err) = self.send_command(HciCommand::ExitSniffMode { handle }) {
            conn.lock().sniff.abort_exit();
            return Err(err);
        }
        Ok(())
    }

    fn read_remote_features(&self, conn: &ConnRef) {
        let (conn_type, handle) = {
            let inner = conn.lock();
            (inner.conn_type, inner.handle)
        };
        let command = match conn_type {
            ConnType::Le => HciCommand::LeReadRemoteFeatures { handle },
            ConnType::Br => HciCommand::ReadRemoteFeatures { handle },
            _ => return,
        };
        if let Err(err) = self.send_command(command) {
            warn!("conn 0x{:04x}: feature exchange not started: {}", handle, err);
        }
    }

    /// Remote features, `Busy` until the exchange finished
    pub fn remote_info(&self, conn: &ConnRef) -> ConnResult<RemoteInfo> {
        let inner = conn.lock();
        if !inner.state.has_handle() {
            return Err(ConnError::NotConnected);
        }
        if !inner.flags.contains(ConnFlags::REMOTE_INFO) {
            return Err(ConnError::Busy);
        }
        let features = match &inner.link {
            LinkParams::Le(le) => le.features,
            LinkParams::Br(br) => br.features,
            _ => return Err(ConnError::NotSupported),
        };
        Ok(RemoteInfo {
            conn_type: inner.conn_type,
            features,
        })
    }

    /// Snapshot of `conn`
    pub fn info(&self, conn: &ConnRef) -> ConnInfo {
        conn.info()
    }
}

impl std::fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnManager")
            .field("flow", &self.flow)
            .field("tx_pool", &self.tx_pool)
            .field("frag_pool", &self.frag_pool)
            .finish()
    }
}
