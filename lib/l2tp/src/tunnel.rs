//! Per-tunnel reliability state. A `Tunnel` slot covers both roles: a
//! control connection (participates in seq/ack, owns an endpoint) and a
//! data session (borrows the sibling control connection's endpoint).

use crate::seq;
use crate::support::HostId;
use crate::transport::EndpointId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use strand::logging;

/// Control-vs-data role.
pub const FLAG_CONTROL: u32 = 0x0001;
/// Double the retransmission timeout on every retry, up to the cap.
pub const FLAG_ADAPT_TIMER: u32 = 0x0002;
/// Verbose per-command logging.
pub const FLAG_DEBUG: u32 = 0x0004;
/// Peer requested sequence numbers on data frames.
pub const FLAG_PEER_SEQ_REQ: u32 = 0x0008;

/// Session is established, data can be transferred.
pub const STATE_SESSION_EST: u32 = 0x0001;
/// An acknowledgement is owed: piggyback on the next outbound control
/// frame, or emit a zero-body ack on the next fast tick.
pub const STATE_NEW_SEQUENCE: u32 = 0x0002;
/// Torn down, retained for a full retransmission cycle.
pub const STATE_FREEING: u32 = 0x0004;

pub const DEFAULT_WINDOW_SIZE: u16 = 4;
/// Seconds; stored internally in half-second ticks.
pub const DEFAULT_INITIAL_TIMEOUT: u16 = 1;
pub const DEFAULT_TIMEOUT_CAP: u16 = 8;
pub const DEFAULT_RETRY_COUNT: u16 = 5;

/// Post-teardown linger, in half-second ticks (31 seconds).
pub const FREE_LINGER_TICKS: u16 = 62;

/// An unacknowledged control frame. The packet keeps its stamped header;
/// only the embedded `nr` is refreshed on retransmit.
pub struct QueuedFrame {
    pub seqno: u16,
    pub addr: SocketAddr,
    pub packet: Vec<u8>,
}

/// An out-of-order control frame held until the gap fills, or a buffered
/// initial request on the listener.
pub struct HeldFrame {
    pub seqno: u16,
    pub from: SocketAddr,
    pub packet: Vec<u8>,
}

pub struct Tunnel {
    pub(crate) opened: bool,
    pub(crate) host: HostId,
    pub(crate) flags: u32,
    pub(crate) state: u32,
    pub(crate) endpoint: Option<EndpointId>,
    pub(crate) peer_address: Option<SocketAddr>,
    pub(crate) our_address: Option<SocketAddr>,

    pub(crate) our_tunnel_id: u16,
    pub(crate) peer_tunnel_id: u16,
    pub(crate) our_session_id: u16,
    pub(crate) peer_session_id: u16,

    pub(crate) our_window: u16,
    pub(crate) peer_window: u16,

    pub(crate) free_time_remain: u16,
    pub(crate) initial_timeout: u16,
    pub(crate) timeout_cap: u16,
    pub(crate) max_retries: u16,
    pub(crate) retry_count: u16,
    pub(crate) retrans_time_remain: u16,

    pub(crate) our_ns: u16,
    pub(crate) our_nr: u16,
    pub(crate) peer_nr: u16,
    pub(crate) our_last_data_seq: u16,
    pub(crate) peer_last_data_seq: u16,

    pub(crate) send_queue: VecDeque<QueuedFrame>,
    pub(crate) recv_queue: VecDeque<HeldFrame>,

    pub(crate) log: logging::Logger,
}

impl Tunnel {
    pub(crate) fn new(log: &logging::Logger) -> Tunnel {
        Tunnel {
            opened: false,
            host: 0,
            flags: 0,
            state: 0,
            endpoint: None,
            peer_address: None,
            our_address: None,
            our_tunnel_id: 0,
            peer_tunnel_id: 0,
            our_session_id: 0,
            peer_session_id: 0,
            our_window: 0,
            peer_window: 0,
            free_time_remain: 0,
            initial_timeout: 0,
            timeout_cap: 0,
            max_retries: 0,
            retry_count: 0,
            retrans_time_remain: 0,
            our_ns: 0,
            our_nr: 0,
            peer_nr: 0,
            our_last_data_seq: 0,
            peer_last_data_seq: 0,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            log: log.new(logging::o!()),
        }
    }

    /// Initializes the slot for a new client with sane defaults.
    pub(crate) fn open(&mut self, host: HostId) {
        if self.opened {
            panic!("Attempted to open a live tunnel slot");
        }

        self.opened = true;
        self.host = host;
        self.flags = FLAG_ADAPT_TIMER;
        self.our_window = DEFAULT_WINDOW_SIZE;
        self.peer_window = DEFAULT_WINDOW_SIZE;
        self.initial_timeout = DEFAULT_INITIAL_TIMEOUT * 2;
        self.timeout_cap = DEFAULT_TIMEOUT_CAP * 2;
        self.max_retries = DEFAULT_RETRY_COUNT;

        logging::debug!(self.log, "tunnel opened"; "host" => self.host);
    }

    /// Clears the slot for reuse, dropping every queued frame.
    pub(crate) fn close(&mut self) {
        logging::debug!(self.log, "tunnel closed";
                        "host" => self.host,
                        "our_tunnel_id" => self.our_tunnel_id,
                        "sent_pending" => self.send_queue.len(),
                        "held" => self.recv_queue.len());

        let log = self.log.clone();
        *self = Tunnel::new(&log);
    }

    #[inline]
    pub(crate) fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    #[inline]
    pub(crate) fn is_freeing(&self) -> bool {
        self.state & STATE_FREEING != 0
    }

    /// True when a frame with this seqno fits the peer's receive window.
    #[inline]
    pub(crate) fn window_allows(&self, seqno: u16) -> bool {
        seq::lt(seqno, self.peer_nr.wrapping_add(self.peer_window))
    }

    /// Inserts an out-of-order frame keeping the queue strictly ascending
    /// by modular seqno. Exact duplicates are dropped. Every held seqno is
    /// strictly greater than `our_nr`; the caller has already checked.
    pub(crate) fn insert_recv(&mut self, frame: HeldFrame) -> bool {
        let mut at = self.recv_queue.len();

        for (idx, held) in self.recv_queue.iter().enumerate() {
            if held.seqno == frame.seqno {
                return false;
            }
            if seq::gt(held.seqno, frame.seqno) {
                at = idx;
                break;
            }
        }

        self.recv_queue.insert(at, frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(seqno: u16) -> HeldFrame {
        HeldFrame {
            seqno,
            from: "127.0.0.1:1701".parse().unwrap(),
            packet: Vec::new(),
        }
    }

    fn seqnos(tunnel: &Tunnel) -> Vec<u16> {
        tunnel.recv_queue.iter().map(|frame| frame.seqno).collect()
    }

    #[test]
    fn test_insert_recv_keeps_ascending_order() {
        let mut tunnel = Tunnel::new(&strand::logging::discard());

        assert!(tunnel.insert_recv(held(5)));
        assert!(tunnel.insert_recv(held(2)));
        assert!(tunnel.insert_recv(held(9)));
        assert!(tunnel.insert_recv(held(3)));

        assert_eq!(seqnos(&tunnel), vec![2, 3, 5, 9]);
    }

    #[test]
    fn test_insert_recv_drops_duplicates() {
        let mut tunnel = Tunnel::new(&strand::logging::discard());

        assert!(tunnel.insert_recv(held(4)));
        assert!(!tunnel.insert_recv(held(4)));

        assert_eq!(seqnos(&tunnel), vec![4]);
    }

    #[test]
    fn test_insert_recv_modular_order_across_wrap() {
        let mut tunnel = Tunnel::new(&strand::logging::discard());
        tunnel.our_nr = 0xFFFE;

        assert!(tunnel.insert_recv(held(1)));
        assert!(tunnel.insert_recv(held(0xFFFF)));
        assert!(tunnel.insert_recv(held(0)));

        assert_eq!(seqnos(&tunnel), vec![0xFFFF, 0, 1]);
    }

    #[test]
    fn test_window_allows() {
        let mut tunnel = Tunnel::new(&strand::logging::discard());
        tunnel.peer_nr = 10;
        tunnel.peer_window = 4;

        assert!(tunnel.window_allows(10));
        assert!(tunnel.window_allows(13));
        assert!(!tunnel.window_allows(14));
    }

    #[test]
    fn test_window_allows_across_wrap() {
        let mut tunnel = Tunnel::new(&strand::logging::discard());
        tunnel.peer_nr = 0xFFFE;
        tunnel.peer_window = 4;

        assert!(tunnel.window_allows(0xFFFE));
        assert!(tunnel.window_allows(1));
        assert!(!tunnel.window_allows(2));
    }
}
