//! The reliability engine: a process-wide arena of tunnel records, request
//! routing from the UDP adapter, the command surface driven by the
//! controller, and the two timer paths (piggyback acks and adaptive
//! retransmission).

use crate::seq;
use crate::support::{Error, ErrorType, Event, HostId, Result, TunnelHost, Verdict};
use crate::transport::{EndpointId, Endpoints};
use crate::tunnel::{
    HeldFrame, QueuedFrame, Tunnel, FLAG_ADAPT_TIMER, FLAG_PEER_SEQ_REQ, FREE_LINGER_TICKS,
    STATE_FREEING, STATE_NEW_SEQUENCE, STATE_SESSION_EST,
};
use crate::wire;
use indexmap::IndexSet;
use std::net::SocketAddr;
use strand::logging;

pub type Handle = usize;

const MAX_DATAGRAM: usize = 4096;

/// The engine's configuration and inspection surface. One variant per
/// recognized command; the set is closed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    SetFlags(u32),
    GetFlags,
    SetWindow(u16),
    SetPeerWindow(u16),
    /// Atomically allocates a tunnel id unique across live records.
    GetNewTunnelId,
    SetTunnelId(u16),
    GetTunnelId,
    SetPeerTunnelId(u16),
    SetSessionId(u16),
    GetSessionId,
    SetPeerSessionId(u16),
    /// Initial retransmission timeout, in seconds.
    SetTimeout(u16),
    /// Retransmission timeout cap, in seconds.
    SetTimeoutCap(u16),
    SetMaxRetries(u16),
    /// Transfers a buffered initial request from a listener tunnel.
    Accept,
    SetPeerAddr(Option<SocketAddr>),
    GetPeerAddr,
    SetOurAddr(Option<SocketAddr>),
    GetOurAddr,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Reply {
    None,
    Flags(u32),
    Id(u16),
    Addr(Option<SocketAddr>),
}

pub struct Engine {
    tunnels: Vec<Tunnel>,
    free: Vec<Handle>,
    live: IndexSet<Handle>,
    endpoints: Endpoints,
    last_tunnel_id: u16,
    log: logging::Logger,
}

impl Engine {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Engine {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Engine {
            tunnels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            endpoints: Endpoints::new(&log),
            last_tunnel_id: 0,
            log,
        }
    }

    /// Creates a tunnel record with zeroed counters and default window and
    /// retransmission settings. Up-calls carry `host` back verbatim.
    pub fn new_client(&mut self, host: HostId) -> Handle {
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                self.tunnels.push(Tunnel::new(&self.log));
                self.tunnels.len() - 1
            }
        };

        self.tunnels[handle].open(host);
        self.live.insert(handle);

        logging::debug!(self.log, "new client"; "handle" => handle, "host" => host);

        handle
    }

    /// Releases a tunnel. Established control connections are kept around
    /// for a full retransmission cycle so in-flight peer traffic still has
    /// somewhere to go; everything else is freed immediately.
    pub fn free_client(&mut self, handle: Handle) {
        let tunnel = &mut self.tunnels[handle];

        if tunnel.is_control() && tunnel.our_tunnel_id != 0 && tunnel.peer_tunnel_id != 0 {
            logging::debug!(tunnel.log, "tunnel entering linger";
                            "handle" => handle,
                            "our_tunnel_id" => tunnel.our_tunnel_id);
            tunnel.state |= STATE_FREEING;
            tunnel.free_time_remain = FREE_LINGER_TICKS;
        } else {
            self.free_now(handle);
        }
    }

    fn free_now(&mut self, handle: Handle) {
        let tunnel = &mut self.tunnels[handle];

        if let Some(endpoint) = tunnel.endpoint.take() {
            self.endpoints.detach(endpoint);
        }

        tunnel.close();
        self.live.remove(&handle);
        self.free.push(handle);
    }

    #[inline]
    pub fn is_live(&self, handle: Handle) -> bool {
        self.live.contains(&handle)
    }

    #[inline]
    pub fn host(&self, handle: Handle) -> HostId {
        self.tunnels[handle].host
    }

    #[inline]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[inline]
    pub fn endpoints_mut(&mut self) -> &mut Endpoints {
        &mut self.endpoints
    }

    pub fn command(
        &mut self,
        handle: Handle,
        cmd: Command,
        hosts: &mut dyn TunnelHost,
    ) -> Result<Reply> {
        logging::trace!(self.tunnels[handle].log, "command"; "handle" => handle, "cmd" => ?cmd);

        match cmd {
            Command::SetFlags(flags) => {
                self.tunnels[handle].flags = flags;
                Ok(Reply::None)
            }
            Command::GetFlags => Ok(Reply::Flags(self.tunnels[handle].flags)),
            Command::SetWindow(window) => {
                self.tunnels[handle].our_window = window;
                Ok(Reply::None)
            }
            Command::SetPeerWindow(window) => {
                self.tunnels[handle].peer_window = window;
                Ok(Reply::None)
            }
            Command::GetNewTunnelId => {
                let id = self.alloc_tunnel_id();
                self.tunnels[handle].our_tunnel_id = id;
                Ok(Reply::Id(id))
            }
            Command::SetTunnelId(id) => self.set_tunnel_id(handle, id),
            Command::GetTunnelId => Ok(Reply::Id(self.tunnels[handle].our_tunnel_id)),
            Command::SetPeerTunnelId(id) => {
                self.tunnels[handle].peer_tunnel_id = id;
                Ok(Reply::None)
            }
            Command::SetSessionId(id) => {
                let tunnel = &mut self.tunnels[handle];
                if tunnel.is_control() {
                    return Err(Error::Fatal(ErrorType::InvalidArg));
                }
                tunnel.our_session_id = id;
                Self::update_session_est(tunnel);
                Ok(Reply::None)
            }
            Command::GetSessionId => Ok(Reply::Id(self.tunnels[handle].our_session_id)),
            Command::SetPeerSessionId(id) => {
                let tunnel = &mut self.tunnels[handle];
                if tunnel.is_control() {
                    return Err(Error::Fatal(ErrorType::InvalidArg));
                }
                tunnel.peer_session_id = id;
                Self::update_session_est(tunnel);
                Ok(Reply::None)
            }
            Command::SetTimeout(secs) => {
                self.tunnels[handle].initial_timeout = secs.saturating_mul(2);
                Ok(Reply::None)
            }
            Command::SetTimeoutCap(secs) => {
                self.tunnels[handle].timeout_cap = secs.saturating_mul(2);
                Ok(Reply::None)
            }
            Command::SetMaxRetries(count) => {
                self.tunnels[handle].max_retries = count;
                Ok(Reply::None)
            }
            Command::Accept => self.accept(handle, hosts).map(|()| Reply::None),
            Command::SetPeerAddr(addr) => self.set_peer_addr(handle, addr),
            Command::GetPeerAddr => Ok(Reply::Addr(self.tunnels[handle].peer_address)),
            Command::SetOurAddr(addr) => self.set_our_addr(handle, addr),
            Command::GetOurAddr => Ok(Reply::Addr(self.tunnels[handle].our_address)),
        }
    }

    fn update_session_est(tunnel: &mut Tunnel) {
        if tunnel.our_session_id != 0 && tunnel.peer_session_id != 0 {
            tunnel.state |= STATE_SESSION_EST;
        }
    }

    fn alloc_tunnel_id(&mut self) -> u16 {
        loop {
            self.last_tunnel_id = self.last_tunnel_id.wrapping_add(1);
            if self.last_tunnel_id == 0 {
                continue;
            }

            let id = self.last_tunnel_id;
            let taken = self
                .live
                .iter()
                .any(|&handle| self.tunnels[handle].our_tunnel_id == id);

            if !taken {
                return id;
            }
        }
    }

    /// Data sessions joining a tunnel id attach to the sibling control
    /// connection's endpoint rather than binding their own.
    fn set_tunnel_id(&mut self, handle: Handle, id: u16) -> Result<Reply> {
        self.tunnels[handle].our_tunnel_id = id;

        if !self.tunnels[handle].is_control() {
            if let Some(old) = self.tunnels[handle].endpoint.take() {
                self.endpoints.detach(old);
            }

            let sibling = self
                .live
                .iter()
                .cloned()
                .find(|&other| {
                    other != handle
                        && self.tunnels[other].is_control()
                        && self.tunnels[other].our_tunnel_id == id
                })
                .and_then(|other| self.tunnels[other].endpoint);

            if let Some(endpoint) = sibling {
                self.endpoints.share(endpoint);
                self.tunnels[handle].endpoint = Some(endpoint);
            }
        }

        Ok(Reply::None)
    }

    fn set_peer_addr(&mut self, handle: Handle, addr: Option<SocketAddr>) -> Result<Reply> {
        let addr = match addr {
            Some(addr) => addr,
            None => {
                self.tunnels[handle].peer_address = None;
                return Ok(Reply::None);
            }
        };

        self.tunnels[handle].peer_address = Some(addr);

        if !self.tunnels[handle].is_control() {
            return Ok(Reply::None);
        }

        let endpoint = match self.tunnels[handle].endpoint {
            Some(endpoint) => endpoint,
            None => return Err(Error::Fatal(ErrorType::NoEndpoint)),
        };

        match self.endpoints.set_peer(endpoint, addr) {
            Ok(()) => Ok(Reply::None),
            Err(Error::Fatal(ErrorType::AddrInUse)) => {
                // Another control tunnel already owns this 4-tuple; take
                // over its socket instead of keeping the fresh bind.
                let our_address = self.tunnels[handle].our_address;
                let conflicting = self
                    .live
                    .iter()
                    .cloned()
                    .find(|&other| {
                        other != handle && {
                            let tunnel = &self.tunnels[other];
                            tunnel.is_control()
                                && tunnel.our_address.is_some()
                                && tunnel.our_address == our_address
                                && tunnel.peer_address == Some(addr)
                        }
                    })
                    .and_then(|other| self.tunnels[other].endpoint);

                match conflicting {
                    Some(other) => {
                        self.endpoints.detach(endpoint);
                        self.endpoints.share(other);
                        self.tunnels[handle].endpoint = Some(other);
                        Ok(Reply::None)
                    }
                    None => Err(Error::Fatal(ErrorType::AddrInUse)),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn set_our_addr(&mut self, handle: Handle, addr: Option<SocketAddr>) -> Result<Reply> {
        let tunnel = &mut self.tunnels[handle];

        if let Some(old) = tunnel.endpoint.take() {
            self.endpoints.detach(old);
        }

        tunnel.our_address = addr;

        let addr = match addr {
            Some(addr) => addr,
            None => return Ok(Reply::None),
        };

        if tunnel.is_control() {
            tunnel.endpoint = Some(self.endpoints.attach(addr)?);
        }

        Ok(Reply::None)
    }

    /// Transfers the head frame of the first non-empty id-0 listener queue
    /// to this tunnel and delivers it. `Error::Wait` when no establishment
    /// request is pending.
    fn accept(&mut self, handle: Handle, hosts: &mut dyn TunnelHost) -> Result<()> {
        let listener = self.live.iter().cloned().find(|&other| {
            let tunnel = &self.tunnels[other];
            tunnel.is_control() && tunnel.our_tunnel_id == 0 && !tunnel.recv_queue.is_empty()
        });

        let listener = match listener {
            Some(listener) => listener,
            None => return Err(Error::Wait),
        };

        let elem = self.tunnels[listener].recv_queue.pop_front().unwrap();

        let tunnel = &mut self.tunnels[handle];
        tunnel.our_nr = 1;
        tunnel.state |= STATE_NEW_SEQUENCE;

        logging::debug!(tunnel.log, "accepted inbound tunnel request";
                        "handle" => handle,
                        "from" => %elem.from);

        hosts.on_input(tunnel.host, &elem.packet, Some(elem.from), true);

        Ok(())
    }

    /// Submits a frame for transmission. Control frames arrive with header
    /// space in front (session id already filled in) and join the reliable
    /// send queue; data frames are prefixed and sent exactly once.
    pub fn output(&mut self, handle: Handle, packet: Vec<u8>, to: Option<SocketAddr>) -> Result<()> {
        let Engine {
            tunnels, endpoints, ..
        } = self;
        let tunnel = &mut tunnels[handle];

        if tunnel.is_freeing() {
            return Err(Error::Fatal(ErrorType::Closed));
        }

        if tunnel.is_control() {
            Self::output_control(tunnel, endpoints, packet, to)
        } else {
            Self::output_data(tunnel, endpoints, packet)
        }
    }

    fn output_control(
        tunnel: &mut Tunnel,
        endpoints: &mut Endpoints,
        mut packet: Vec<u8>,
        to: Option<SocketAddr>,
    ) -> Result<()> {
        if packet.len() < wire::CONTROL_HDR_SIZE {
            return Err(Error::Fatal(ErrorType::InvalidArg));
        }

        let dest = match to.or(tunnel.peer_address) {
            Some(dest) => dest,
            None => return Err(Error::Fatal(ErrorType::InvalidArg)),
        };

        let ns = tunnel.our_ns;
        tunnel.our_ns = tunnel.our_ns.wrapping_add(1);
        wire::stamp_control(&mut packet, tunnel.peer_tunnel_id, ns, tunnel.our_nr);

        if tunnel.send_queue.is_empty() {
            tunnel.retry_count = 0;
            tunnel.retrans_time_remain = tunnel.initial_timeout;
        }

        tunnel.send_queue.push_back(QueuedFrame {
            seqno: ns,
            addr: dest,
            packet,
        });

        if tunnel.window_allows(ns) {
            // The ack rides on this frame
            tunnel.state &= !STATE_NEW_SEQUENCE;
            let elem = tunnel.send_queue.back().unwrap();
            return Self::transmit(endpoints, tunnel, elem);
        }

        Ok(())
    }

    fn output_data(tunnel: &mut Tunnel, endpoints: &mut Endpoints, packet: Vec<u8>) -> Result<()> {
        let dest = match tunnel.peer_address {
            Some(dest) => dest,
            None => return Err(Error::Fatal(ErrorType::InvalidArg)),
        };

        let seq = if tunnel.flags & FLAG_PEER_SEQ_REQ != 0 {
            let ns = tunnel.our_last_data_seq;
            tunnel.our_last_data_seq = ns.wrapping_add(1);
            Some(ns)
        } else {
            None
        };

        let mut frame =
            wire::data_header(tunnel.peer_tunnel_id, tunnel.peer_session_id, packet.len(), seq);
        frame.extend_from_slice(&packet);

        let endpoint = match tunnel.endpoint {
            Some(endpoint) => endpoint,
            None => return Err(Error::Fatal(ErrorType::NoEndpoint)),
        };

        endpoints.send(endpoint, &frame, &dest)
    }

    /// Sends a queued control frame with the acknowledgement field stamped
    /// fresh. The queued copy itself is never mutated.
    fn transmit(endpoints: &mut Endpoints, tunnel: &Tunnel, elem: &QueuedFrame) -> Result<()> {
        let endpoint = match tunnel.endpoint {
            Some(endpoint) => endpoint,
            None => return Err(Error::Fatal(ErrorType::NoEndpoint)),
        };

        let mut dup = elem.packet.clone();
        wire::restamp_nr(&mut dup, tunnel.our_nr);

        endpoints.send(endpoint, &dup, &elem.addr)
    }

    /// Reads every pending datagram off an endpoint and routes it.
    pub fn drain_endpoint(&mut self, endpoint: EndpointId, hosts: &mut dyn TunnelHost) {
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            match self.endpoints.recv(endpoint, &mut buf) {
                Ok((count, from)) => {
                    self.receive(&buf[..count], from, hosts);
                }
                Err(_) => break,
            }
        }
    }

    /// Routes one inbound datagram. Returns true when some tunnel consumed
    /// it; unroutable or malformed datagrams are dropped.
    pub fn receive(&mut self, datagram: &[u8], from: SocketAddr, hosts: &mut dyn TunnelHost) -> bool {
        let packet = match wire::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                logging::trace!(self.log, "dropping malformed datagram";
                                "from" => %from,
                                "error" => ?err);
                return false;
            }
        };

        match packet {
            wire::Packet::Control {
                tunnel_id, ns, nr, body, ..
            } => {
                let frame_len = wire::CONTROL_HDR_SIZE + body.len();
                self.route_control(tunnel_id, Some(ns), nr, &datagram[..frame_len], from, hosts)
            }
            wire::Packet::Ack { tunnel_id, nr } => self.route_control(
                tunnel_id,
                None,
                nr,
                &datagram[..wire::CONTROL_HDR_SIZE],
                from,
                hosts,
            ),
            wire::Packet::Data {
                tunnel_id,
                session_id,
                seq,
                body,
            } => self.route_data(tunnel_id, session_id, seq, body, from, hosts),
        }
    }

    fn route_control(
        &mut self,
        tunnel_id: u16,
        ns: Option<u16>,
        nr: u16,
        frame: &[u8],
        from: SocketAddr,
        hosts: &mut dyn TunnelHost,
    ) -> bool {
        let tunnels = &self.tunnels;
        let handle = self.live.iter().cloned().find(|&handle| {
            let tunnel = &tunnels[handle];
            tunnel.is_control()
                && tunnel.our_tunnel_id == tunnel_id
                && tunnel.peer_address.map_or(true, |peer| peer == from)
        });

        let handle = match handle {
            Some(handle) => handle,
            None => {
                logging::trace!(self.log, "no tunnel for control frame";
                                "tunnel_id" => tunnel_id,
                                "from" => %from);
                return false;
            }
        };

        self.control_input(handle, ns, nr, frame, from, hosts);
        true
    }

    fn control_input(
        &mut self,
        handle: Handle,
        ns: Option<u16>,
        nr: u16,
        frame: &[u8],
        from: SocketAddr,
        hosts: &mut dyn TunnelHost,
    ) {
        let Engine {
            tunnels, endpoints, ..
        } = self;
        let tunnel = &mut tunnels[handle];

        // Listener: buffer the first frame of an inbound tunnel, keyed by
        // source. The queued copy stays behind even when the up-call takes
        // the frame, so a retransmitted request still has a home.
        if tunnel.our_tunnel_id == 0 {
            let ns = match ns {
                Some(ns) => ns,
                None => return,
            };
            if ns != 0 {
                return;
            }

            tunnel.recv_queue.push_back(HeldFrame {
                seqno: 0,
                from,
                packet: frame.to_vec(),
            });

            if hosts.on_input(tunnel.host, frame, Some(from), true) == Verdict::Refused {
                tunnel.recv_queue.pop_back();
            }
            return;
        }

        if seq::gt(nr, tunnel.peer_nr) {
            Self::handle_ack(tunnel, endpoints, nr);
        }

        // Zero-length body: pure acknowledgement
        let ns = match ns {
            Some(ns) => ns,
            None => return,
        };

        if seq::gt(ns, tunnel.our_nr) {
            logging::trace!(tunnel.log, "out of order control frame";
                            "ns" => ns,
                            "our_nr" => tunnel.our_nr);
            tunnel.insert_recv(HeldFrame {
                seqno: ns,
                from,
                packet: frame.to_vec(),
            });
            return;
        }

        if seq::lt(ns, tunnel.our_nr) {
            // Duplicate of something already delivered; its ack may have
            // been lost, so owe the peer a fresh one
            tunnel.state |= STATE_NEW_SEQUENCE;
            return;
        }

        // The frame we are waiting for
        if tunnel.is_freeing() {
            tunnel.our_nr = tunnel.our_nr.wrapping_add(1);
            tunnel.state |= STATE_NEW_SEQUENCE;
        } else {
            if hosts.on_input(tunnel.host, frame, Some(from), true) == Verdict::Refused {
                return;
            }
            tunnel.our_nr = tunnel.our_nr.wrapping_add(1);
            tunnel.state |= STATE_NEW_SEQUENCE;
        }

        // Drain buffered successors until the queue empties, a gap appears
        // or the host refuses; a refusal discards the rest of the queue
        let mut buf_full = false;
        while let Some(head) = tunnel.recv_queue.front() {
            if !buf_full && head.seqno != tunnel.our_nr {
                break;
            }

            let elem = tunnel.recv_queue.pop_front().unwrap();
            if buf_full {
                continue;
            }

            if tunnel.is_freeing() {
                tunnel.our_nr = tunnel.our_nr.wrapping_add(1);
            } else if hosts.on_input(tunnel.host, &elem.packet, Some(elem.from), true)
                == Verdict::Refused
            {
                buf_full = true;
            } else {
                tunnel.our_nr = tunnel.our_nr.wrapping_add(1);
            }
        }
    }

    /// Clears frames acknowledged by the peer and transmits any queued
    /// frames the advancing window just uncovered.
    fn handle_ack(tunnel: &mut Tunnel, endpoints: &mut Endpoints, nr: u16) {
        let old_nr = tunnel.peer_nr;
        tunnel.peer_nr = nr;

        while let Some(head) = tunnel.send_queue.front() {
            if seq::gt(nr, head.seqno) {
                tunnel.retrans_time_remain = tunnel.initial_timeout;
                tunnel.retry_count = 0;
                tunnel.send_queue.pop_front();
            } else {
                break;
            }
        }

        if tunnel.send_queue.is_empty() {
            return;
        }

        let new_edge = nr.wrapping_add(tunnel.peer_window).wrapping_sub(1);
        let old_edge = old_nr.wrapping_add(tunnel.peer_window).wrapping_sub(1);

        for idx in 0..tunnel.send_queue.len() {
            let seqno = tunnel.send_queue[idx].seqno;
            if seq::gt(seqno, new_edge) {
                break;
            }
            if seq::gt(seqno, old_edge) {
                let _ = Self::transmit(endpoints, tunnel, &tunnel.send_queue[idx]);
            }
        }
    }

    fn route_data(
        &mut self,
        tunnel_id: u16,
        session_id: u16,
        seqf: Option<(u16, u16)>,
        body: &[u8],
        from: SocketAddr,
        hosts: &mut dyn TunnelHost,
    ) -> bool {
        let tunnels = &self.tunnels;
        let handle = self.live.iter().cloned().find(|&handle| {
            let tunnel = &tunnels[handle];
            !tunnel.is_control()
                && tunnel.our_tunnel_id == tunnel_id
                && tunnel.our_session_id == session_id
                && tunnel.peer_address == Some(from)
        });

        let handle = match handle {
            Some(handle) => handle,
            None => return false,
        };

        let tunnel = &mut self.tunnels[handle];

        if let Some((ns, _)) = seqf {
            if seq::gt(ns, tunnel.peer_last_data_seq) {
                if tunnel.peer_last_data_seq.wrapping_add(1) == ns {
                    tunnel.peer_last_data_seq = ns;
                } else {
                    // A gap in the peer's data sequence; surface it but
                    // still hand the frame up
                    hosts.on_event(tunnel.host, Event::InputError, 0);
                }
            } else {
                // Regression or duplicate
                return true;
            }
        }

        hosts.on_input(tunnel.host, body, None, false);
        true
    }

    /// Fast tick (200 ms): tunnels owing an ack with nothing to piggyback
    /// it on emit a zero-body acknowledgement.
    pub fn fast_tick(&mut self) {
        let Engine {
            tunnels,
            endpoints,
            live,
            ..
        } = self;

        for &handle in live.iter() {
            let tunnel = &mut tunnels[handle];

            if tunnel.state & STATE_NEW_SEQUENCE == 0 || tunnel.peer_tunnel_id == 0 {
                continue;
            }

            let (endpoint, dest) = match (tunnel.endpoint, tunnel.peer_address) {
                (Some(endpoint), Some(dest)) => (endpoint, dest),
                _ => continue,
            };

            let ack = wire::ack(tunnel.peer_tunnel_id, tunnel.our_ns, tunnel.our_nr);
            tunnel.state &= !STATE_NEW_SEQUENCE;
            let _ = endpoints.send(endpoint, &ack, &dest);
        }
    }

    /// Slow tick (500 ms): linger countdown and the retransmission clock.
    pub fn slow_tick(&mut self, hosts: &mut dyn TunnelHost) {
        let handles: Vec<Handle> = self.live.iter().cloned().collect();

        for handle in handles {
            let linger_expired = {
                let tunnel = &mut self.tunnels[handle];
                if tunnel.is_freeing() {
                    tunnel.free_time_remain = tunnel.free_time_remain.saturating_sub(1);
                    tunnel.free_time_remain == 0
                } else {
                    false
                }
            };

            if linger_expired {
                self.free_now(handle);
                continue;
            }

            let Engine {
                tunnels, endpoints, ..
            } = self;
            let tunnel = &mut tunnels[handle];

            // A zero clock means retransmission is idle or already given up
            if tunnel.send_queue.is_empty() || tunnel.retrans_time_remain == 0 {
                continue;
            }

            tunnel.retrans_time_remain -= 1;
            if tunnel.retrans_time_remain != 0 {
                continue;
            }

            tunnel.retry_count += 1;

            if tunnel.retry_count >= tunnel.max_retries {
                logging::debug!(tunnel.log, "retransmission retries exhausted";
                                "handle" => handle,
                                "retries" => tunnel.retry_count);
                if !tunnel.is_freeing() {
                    hosts.on_event(tunnel.host, Event::ReliableFailed, 0);
                }
            } else {
                let head = tunnel.send_queue.front().unwrap();
                let _ = Self::transmit(endpoints, tunnel, head);

                let next = if tunnel.flags & FLAG_ADAPT_TIMER != 0 {
                    let shift = u32::from(tunnel.retry_count.min(12));
                    ((u32::from(tunnel.initial_timeout)) << shift)
                        .min(u32::from(tunnel.timeout_cap)) as u16
                } else {
                    tunnel.initial_timeout.min(tunnel.timeout_cap)
                };
                tunnel.retrans_time_remain = next;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tunnel(&self, handle: Handle) -> &Tunnel {
        &self.tunnels[handle]
    }
}
