//! UDP endpoint management. Endpoints are held in a slot arena and
//! reference counted: a control tunnel owns its endpoint, data sessions
//! and socket transfers join it, and the socket is released when the last
//! user detaches.

use crate::support::{Error, ErrorType, Result};
use mio::net::UdpSocket;
use mio::{Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use strand::logging;

pub type EndpointId = usize;

struct Slot {
    socket: Option<UdpSocket>,
    local: Option<SocketAddr>,
    users: usize,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            socket: None,
            local: None,
            users: 0,
        }
    }
}

pub struct Endpoints {
    slots: Vec<Slot>,
    free: Vec<EndpointId>,
    log: logging::Logger,
}

impl Endpoints {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Endpoints {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Endpoints {
            slots: Vec::new(),
            free: Vec::new(),
            log,
        }
    }

    /// Binds a new endpoint on `local` and returns its handle. The socket
    /// is non-blocking and bound with address reuse so that several control
    /// tunnels can share one local address.
    pub fn attach(&mut self, local: SocketAddr) -> Result<EndpointId> {
        let socket = Self::bind(local)?;

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Slot::new());
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[id];
        slot.local = socket.local_addr().ok();
        slot.socket = Some(socket);
        slot.users = 1;

        logging::debug!(self.log, "endpoint attached";
                        "endpoint_id" => id,
                        "local" => ?slot.local);

        Ok(id)
    }

    fn bind(local: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        Ok(UdpSocket::from_std(socket.into()))
    }

    /// Connects the endpoint so the kernel filters unsolicited datagrams.
    /// `EADDRINUSE` from a conflicting 4-tuple is surfaced to the caller,
    /// which performs the socket-transfer rule.
    pub fn set_peer(&mut self, id: EndpointId, peer: SocketAddr) -> Result<()> {
        let socket = self.socket(id)?;
        socket.connect(peer)?;

        logging::debug!(self.log, "endpoint connected"; "endpoint_id" => id, "peer" => %peer);

        Ok(())
    }

    /// Adds a user to an endpoint (a data session or a transferred tunnel).
    pub fn share(&mut self, id: EndpointId) {
        self.slots[id].users += 1;
    }

    /// Drops a user; releases the socket when the last one leaves. Returns
    /// true if the endpoint was released.
    pub fn detach(&mut self, id: EndpointId) -> bool {
        let slot = &mut self.slots[id];
        slot.users -= 1;

        if slot.users > 0 {
            return false;
        }

        slot.socket = None;
        slot.local = None;
        self.free.push(id);

        logging::debug!(self.log, "endpoint released"; "endpoint_id" => id);

        true
    }

    /// Non-blocking transmit. `Error::Wait` signals a congested path.
    pub fn send(&mut self, id: EndpointId, payload: &[u8], to: &SocketAddr) -> Result<()> {
        let socket = self.socket(id)?;
        socket.send_to(payload, *to)?;

        Ok(())
    }

    /// Non-blocking receive of a single datagram with its source address.
    pub fn recv(&self, id: EndpointId, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let socket = match self.slots.get(id).and_then(|slot| slot.socket.as_ref()) {
            Some(socket) => socket,
            None => return Err(Error::Fatal(ErrorType::NoEndpoint)),
        };

        socket.recv_from(buf).map_err(Into::into)
    }

    #[inline]
    pub fn local_addr(&self, id: EndpointId) -> Option<SocketAddr> {
        self.slots.get(id).and_then(|slot| slot.local)
    }

    #[inline]
    pub fn users(&self, id: EndpointId) -> usize {
        self.slots.get(id).map_or(0, |slot| slot.users)
    }

    /// Registers the endpoint socket on the supplied poll.
    pub fn register(&mut self, id: EndpointId, poll: &Poll, token: Token) -> io::Result<()> {
        let socket = self.slots[id]
            .socket
            .as_mut()
            .expect("Can't register a released endpoint");

        poll.registry().register(socket, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, id: EndpointId, poll: &Poll) -> io::Result<()> {
        let socket = self.slots[id]
            .socket
            .as_mut()
            .expect("Can't deregister a released endpoint");

        poll.registry().deregister(socket)
    }

    /// Handles of all currently bound endpoints.
    pub fn live(&self) -> impl Iterator<Item = EndpointId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.socket.is_some())
            .map(|(id, _)| id)
    }

    fn socket(&mut self, id: EndpointId) -> Result<&mut UdpSocket> {
        match self.slots.get_mut(id).and_then(|slot| slot.socket.as_mut()) {
            Some(socket) => Ok(socket),
            None => Err(Error::Fatal(ErrorType::NoEndpoint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_attach_assigns_local_address() {
        let mut endpoints = Endpoints::new(None);

        let id = endpoints.attach(loopback()).unwrap();

        let local = endpoints.local_addr(id).unwrap();
        assert!(local.port() != 0);
        assert_eq!(endpoints.users(id), 1);
    }

    #[test]
    fn test_share_detach_refcount() {
        let mut endpoints = Endpoints::new(None);
        let id = endpoints.attach(loopback()).unwrap();

        endpoints.share(id);
        endpoints.share(id);

        assert_eq!(endpoints.users(id), 3);
        assert!(!endpoints.detach(id));
        assert!(!endpoints.detach(id));
        assert!(endpoints.detach(id));
        assert_eq!(endpoints.users(id), 0);
        assert!(endpoints.local_addr(id).is_none());
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut endpoints = Endpoints::new(None);

        let first = endpoints.attach(loopback()).unwrap();
        endpoints.detach(first);
        let second = endpoints.attach(loopback()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_send_reaches_peer() {
        let mut endpoints = Endpoints::new(None);
        let id = endpoints.attach(loopback()).unwrap();

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        endpoints.set_peer(id, peer_addr).unwrap();
        endpoints.send(id, b"frame", &peer_addr).unwrap();

        let mut buf = [0u8; 64];
        let (count, from) = peer.recv_from(&mut buf).unwrap();

        assert_eq!(&buf[..count], b"frame");
        assert_eq!(from, endpoints.local_addr(id).unwrap());
    }

    #[test]
    fn test_send_on_released_endpoint() {
        let mut endpoints = Endpoints::new(None);
        let id = endpoints.attach(loopback()).unwrap();
        endpoints.detach(id);

        let to = "127.0.0.1:1701".parse().unwrap();
        assert_eq!(
            endpoints.send(id, b"frame", &to),
            Err(Error::Fatal(ErrorType::NoEndpoint))
        );
    }
}
