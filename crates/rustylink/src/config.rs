//! Connection layer configuration

use crate::conn::types::LeConnParams;
use std::time::Duration;

/// Default number of ACL (BR/EDR + LE) connection objects
pub const DEFAULT_MAX_ACL_CONNS: usize = 4;
/// Credits a BR/EDR sender without packets in flight must leave untouched
pub const CONN_TX_PKT_RESERVE: usize = 1;
/// Window during which a repeated sniff transition request is suppressed
pub const SNIFF_ENTER_EXIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for [`ConnManager`](crate::conn::ConnManager)
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// ACL connection objects, shared by BR/EDR and LE
    pub max_acl_conns: usize,
    /// SCO/eSCO connection objects
    pub max_sco_conns: usize,
    /// ISO connection objects
    pub max_iso_conns: usize,
    /// Capacity of the TX context pool
    pub tx_contexts: usize,
    /// Buffers available for outbound fragments
    pub frag_bufs: usize,
    /// Buffers available for inbound reassembly
    pub rx_bufs: usize,
    /// Largest reassembled ACL PDU, L2CAP header included
    pub rx_buf_size: usize,

    /// BR/EDR ACL payload size per controller buffer
    pub br_acl_mtu: usize,
    /// BR/EDR ACL controller buffers
    pub br_acl_credits: usize,
    /// LE ACL payload size and buffers; `None` shares the BR/EDR buffers
    pub le_acl: Option<(usize, usize)>,
    /// ISO payload size per controller buffer
    pub iso_mtu: usize,
    /// ISO controller buffers
    pub iso_credits: usize,
    /// Largest SCO payload
    pub sco_mtu: usize,
    /// BR/EDR credit reserve margin
    pub br_tx_reserve: usize,

    /// LE create connection timeout (central)
    pub create_conn_timeout: Duration,
    /// Delay before a peripheral sends its preferred parameters
    pub param_update_timeout: Duration,
    /// Window for suppressing repeated sniff transitions
    pub sniff_timeout: Duration,
    /// Interval for logging per-connection throughput, disabled when `None`
    pub data_rate_interval: Option<Duration>,

    /// Parameters a peripheral asks for when the application set none
    pub peripheral_pref: LeConnParams,
    /// Use the HCI LE Connection Update command from the peripheral side
    /// instead of L2CAP signalling
    pub le_conn_param_req: bool,
    /// Read remote features right after a link comes up
    pub auto_feature_exchange: bool,
    /// Scan interval and window used by LE create connection
    pub le_scan_interval: u16,
    pub le_scan_window: u16,
    /// Page scan packet types used by BR/EDR create connection
    pub br_packet_type: u16,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_acl_conns: DEFAULT_MAX_ACL_CONNS,
            max_sco_conns: 1,
            max_iso_conns: 2,
            tx_contexts: 8,
            frag_bufs: 4,
            rx_bufs: 4,
            rx_buf_size: 1024,

            br_acl_mtu: 1021,
            br_acl_credits: 8,
            le_acl: Some((251, 4)),
            iso_mtu: 251,
            iso_credits: 4,
            sco_mtu: 60,
            br_tx_reserve: CONN_TX_PKT_RESERVE,

            create_conn_timeout: Duration::from_secs(3),
            param_update_timeout: Duration::from_secs(5),
            sniff_timeout: SNIFF_ENTER_EXIT_TIMEOUT,
            data_rate_interval: None,

            peripheral_pref: LeConnParams {
                interval_min: 24,
                interval_max: 40,
                latency: 0,
                timeout: 42,
            },
            le_conn_param_req: true,
            auto_feature_exchange: true,
            le_scan_interval: 0x0060,
            le_scan_window: 0x0030,
            br_packet_type: 0xCC18,
        }
    }
}

impl ConnConfig {
    /// Apply Read Buffer Size and LE Read Buffer Size results
    ///
    /// A zero-sized LE buffer means the controller shares its BR/EDR buffers
    /// with LE traffic.
    pub fn with_controller_buffers(mut self, br: (usize, usize), le: (usize, usize)) -> Self {
        self.br_acl_mtu = br.0;
        self.br_acl_credits = br.1;
        self.le_acl = if le.0 == 0 || le.1 == 0 { None } else { Some(le) };
        self
    }

    /// MTU for LE ACL traffic
    pub fn le_acl_mtu(&self) -> usize {
        self.le_acl.map(|(mtu, _)| mtu).unwrap_or(self.br_acl_mtu)
    }
}
