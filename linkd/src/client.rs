//! Per-client connection state on the local control socket: incremental
//! request framing, byte-order detection, reply and event emission, and
//! the client's notification subscriptions and option overlays.

use crate::buffer::Buffer;
use crate::msg::{self, MsgHeader};
use crate::options::OptionSet;
use hashbrown::HashMap;
use mio::net::UnixStream;
use mio::{Interest, Poll, Token};
use std::io;
use std::os::unix::io::AsRawFd;
use strand::logging;

pub type ClientId = usize;

/// Subscription bits set via ENABLE_EVENT.
pub const NOTIFY_EVENTS: u32 = 0x1;
pub const NOTIFY_STATUS: u32 = 0x2;

const READ_BUF_SIZE: usize = 128 * 1024;
const WRITE_BUF_SIZE: usize = 256 * 1024;

/// A complete request, body and optional service-id tail included. Header
/// fields are already in host order.
#[derive(Debug)]
pub struct Message {
    pub hdr: MsgHeader,
    pub serviceid: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    /// The raw service-id tail echoed back on replies.
    #[inline]
    pub fn serviceid_tail(&self) -> Option<&str> {
        self.serviceid.as_deref()
    }
}

pub struct Client {
    id: Option<ClientId>,
    stream: Option<UnixStream>,

    read_buffer: Buffer,
    write_buffer: Buffer,
    /// Header of the message currently being assembled.
    pending: Option<MsgHeader>,

    /// Byte order decided on the first complete header and applied to both
    /// directions from then on.
    swap_latched: bool,
    swap: bool,

    uid: u32,
    privileged: bool,

    pub notify_flags: u32,
    pub notify_link: u32,
    pub notify_serviceid: Option<String>,

    /// Per-service option overlays set by this client before connecting.
    pub opts: HashMap<String, OptionSet>,

    log: logging::Logger,
}

impl Client {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Client {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Client {
            id: None,
            stream: None,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            pending: None,
            swap_latched: false,
            swap: false,
            uid: u32::max_value(),
            privileged: false,
            notify_flags: 0,
            notify_link: 0,
            notify_serviceid: None,
            opts: HashMap::new(),
            log,
        }
    }

    /// Binds the slot to an accepted stream. Privilege is derived from the
    /// connecting peer's credentials.
    pub fn open(&mut self, id: ClientId, stream: UnixStream) {
        if self.stream.is_some() {
            panic!("Attempted to open a connected client slot");
        }

        self.uid = peer_uid(&stream).unwrap_or(u32::max_value());
        self.privileged = self.uid == 0;
        self.id = Some(id);
        self.stream = Some(stream);

        logging::debug!(self.log, "client connected";
                        "client_id" => id,
                        "uid" => self.uid,
                        "privileged" => self.privileged);
    }

    /// Clears the slot for reuse.
    pub fn close(&mut self) {
        logging::debug!(self.log, "client closed";
                        "client_id" => self.id,
                        "unread" => self.read_buffer.len(),
                        "unsent" => self.write_buffer.len());

        self.stream = None;
        self.id = None;
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.pending = None;
        self.swap_latched = false;
        self.swap = false;
        self.uid = u32::max_value();
        self.privileged = false;
        self.notify_flags = 0;
        self.notify_link = 0;
        self.notify_serviceid = None;
        self.opts.clear();
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    #[inline]
    pub fn swaps(&self) -> bool {
        self.swap
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    pub fn register(&mut self, poll: &Poll, token: Token) -> io::Result<()> {
        let stream = self.stream.as_mut().expect("Can't register a closed client");
        poll.registry()
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&mut self, poll: &Poll) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .expect("Can't deregister a closed client");
        poll.registry().deregister(stream)
    }

    /// Reads everything available off the stream into the receive buffer.
    pub fn receive(&mut self) -> io::Result<usize> {
        let stream = self.stream.as_mut().expect("Client must have a stream");
        self.read_buffer.ingress(stream)
    }

    /// Flushes as much buffered output as the stream accepts.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Client must have a stream");
        self.write_buffer.egress(stream)
    }

    /// Assembles the next complete request, stitching partial reads across
    /// calls. `Ok(None)` means more bytes are needed.
    pub fn next_message(&mut self) -> io::Result<Option<Message>> {
        if self.pending.is_none() {
            if self.read_buffer.len() < msg::HDR_SIZE {
                return Ok(None);
            }

            let mut hdr = MsgHeader::read(self.read_buffer.read_slice());

            if !self.swap_latched {
                self.swap = !self.privileged && hdr.mtype > msg::LAST_REQUEST;
                self.swap_latched = true;

                if self.swap {
                    logging::debug!(self.log, "network byte order client detected";
                                    "client_id" => self.id);
                }
            }

            if self.swap {
                hdr = hdr.swapped();
            }

            let sid_len = if hdr.has_serviceid() { hdr.link as usize } else { 0 };
            if hdr.len == msg::NO_REPLY || sid_len + hdr.len as usize > msg::MAX_MSG_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Unreasonable message length",
                ));
            }

            self.read_buffer.consume(msg::HDR_SIZE);
            self.pending = Some(hdr);
        }

        let hdr = self.pending.expect("Pending header just checked");
        let sid_len = if hdr.has_serviceid() { hdr.link as usize } else { 0 };
        let body_len = hdr.len as usize;

        if self.read_buffer.len() < sid_len + body_len {
            return Ok(None);
        }

        let slice = self.read_buffer.read_slice();
        let serviceid = if sid_len > 0 {
            Some(
                String::from_utf8_lossy(&slice[..sid_len])
                    .trim_end_matches('\0')
                    .to_string(),
            )
        } else {
            None
        };
        let body = slice[sid_len..sid_len + body_len].to_vec();

        self.read_buffer.consume(sid_len + body_len);
        self.pending = None;

        Ok(Some(Message {
            hdr,
            serviceid,
            body,
        }))
    }

    /// Queues a reply: the (possibly swapped) header, the echoed service-id
    /// tail, then the body. A header length of `NO_REPLY` suppresses the
    /// reply entirely.
    pub fn send_reply(&mut self, hdr: &MsgHeader, serviceid: Option<&str>, body: &[u8]) {
        if hdr.len == msg::NO_REPLY {
            return;
        }

        let tail = serviceid.map_or(0, |sid| sid.len());
        if msg::HDR_SIZE + tail + body.len() > self.write_buffer.free_capacity() {
            logging::warn!(self.log, "reply dropped, client not draining";
                           "client_id" => self.id,
                           "len" => body.len());
            return;
        }

        let wire_hdr = if self.swap { hdr.swapped() } else { *hdr };
        let mut buf = [0u8; msg::HDR_SIZE];
        wire_hdr.write(&mut buf);

        self.write_buffer.append(&buf);
        if let Some(sid) = serviceid {
            self.write_buffer.append(sid.as_bytes());
        }
        self.write_buffer.append(body);
    }

    /// Queues a header-only event message, optionally carrying a service-id
    /// tail.
    pub fn send_event(&mut self, event: u32, error: u32, link: u32, serviceid: Option<&str>) {
        let mut hdr = MsgHeader {
            flags: 0,
            mtype: msg::EVENT,
            result: event,
            cookie: error,
            link,
            len: 0,
        };

        if let Some(sid) = serviceid {
            hdr.flags |= msg::USE_SERVICEID;
            hdr.link = sid.len() as u32;
        }

        self.send_reply(&hdr, serviceid, &[]);
    }

    /// True when a notification of `kind` about the given session passes
    /// this client's subscription filter.
    pub fn wants_notification(&self, kind: u32, serviceid: &str, link_ref: u32) -> bool {
        if !self.is_open() || self.notify_flags & kind == 0 {
            return false;
        }

        if let Some(filter) = &self.notify_serviceid {
            return filter == serviceid;
        }

        if self.notify_link != 0 {
            return self.notify_link == link_ref;
        }

        true
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.read_buffer.append(bytes);
    }

    #[cfg(test)]
    pub(crate) fn queued_output(&self) -> &[u8] {
        self.write_buffer.read_slice()
    }

    #[cfg(test)]
    pub(crate) fn force_privileged(&mut self, privileged: bool) {
        self.privileged = privileged;
    }
}

#[cfg(target_os = "linux")]
fn peer_uid(stream: &UnixStream) -> io::Result<u32> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(cred.uid)
}

#[cfg(not(target_os = "linux"))]
fn peer_uid(stream: &UnixStream) -> io::Result<u32> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;

    let rc = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    fn header_bytes(hdr: &MsgHeader) -> [u8; msg::HDR_SIZE] {
        let mut buf = [0u8; msg::HDR_SIZE];
        hdr.write(&mut buf);
        buf
    }

    #[test]
    fn test_partial_header_waits() {
        let mut client = Client::new(None);
        let hdr = MsgHeader {
            mtype: msg::STATUS,
            ..Default::default()
        };

        client.feed(&header_bytes(&hdr)[..10]);
        assert!(client.next_message().unwrap().is_none());

        client.feed(&header_bytes(&hdr)[10..]);
        let message = client.next_message().unwrap().unwrap();
        assert_eq!(message.hdr.mtype, msg::STATUS);
        assert!(message.serviceid.is_none());
        assert!(message.body.is_empty());
    }

    #[test]
    fn test_body_and_serviceid_stitched_across_reads() {
        let mut client = Client::new(None);
        let hdr = MsgHeader {
            flags: msg::USE_SERVICEID,
            mtype: msg::CONNECT,
            link: 7,
            len: 4,
            ..Default::default()
        };

        client.feed(&header_bytes(&hdr));
        client.feed(b"net");
        assert!(client.next_message().unwrap().is_none());

        client.feed(b".ppp\x01\x02\x03\x04");
        let message = client.next_message().unwrap().unwrap();

        assert_eq!(message.serviceid.as_deref(), Some("net.ppp"));
        assert_eq!(message.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_network_order_client_swapped_both_ways() {
        let mut client = Client::new(None);

        // A big-endian client's STATUS request, as raw wire bytes
        let mut wire = [0u8; msg::HDR_SIZE];
        BigEndian::write_u16(&mut wire[0..], 0);
        BigEndian::write_u16(&mut wire[2..], msg::STATUS);
        BigEndian::write_u32(&mut wire[12..], 0x0003_0001);
        client.feed(&wire);

        let message = client.next_message().unwrap().unwrap();

        // On a little-endian daemon the type decodes huge and latches the
        // swap; on a big-endian daemon it decodes directly. Either way the
        // effective header is identical.
        assert_eq!(message.hdr.mtype, msg::STATUS);
        assert_eq!(message.hdr.link, 0x0003_0001);

        // The reply goes out in the client's order
        let reply = MsgHeader {
            mtype: msg::STATUS,
            result: msg::ENODEV,
            ..Default::default()
        };
        client.send_reply(&reply, None, &[]);

        let out = client.queued_output();
        assert_eq!(BigEndian::read_u16(&out[2..]), msg::STATUS);
        assert_eq!(BigEndian::read_u32(&out[4..]), msg::ENODEV);
    }

    #[test]
    fn test_byte_order_latched_on_first_header() {
        let mut client = Client::new(None);

        // First request is host order; the latch fixes host order even if a
        // later type value looks out of range
        let first = MsgHeader {
            mtype: msg::VERSION,
            ..Default::default()
        };
        client.feed(&header_bytes(&first));
        assert_eq!(client.next_message().unwrap().unwrap().hdr.mtype, msg::VERSION);
        assert!(!client.swaps());

        let odd = MsgHeader {
            mtype: 0x7F00,
            ..Default::default()
        };
        client.feed(&header_bytes(&odd));
        let message = client.next_message().unwrap().unwrap();
        assert_eq!(message.hdr.mtype, 0x7F00);
        assert!(!client.swaps());
    }

    #[test]
    fn test_privileged_client_never_swaps() {
        let mut client = Client::new(None);
        client.force_privileged(true);

        let hdr = MsgHeader {
            mtype: msg::PPPD_PHASE,
            len: 4,
            ..Default::default()
        };
        client.feed(&header_bytes(&hdr));
        client.feed(&[6, 0, 0, 0]);

        let message = client.next_message().unwrap().unwrap();
        assert_eq!(message.hdr.mtype, msg::PPPD_PHASE);
        assert!(!client.swaps());
    }

    #[test]
    fn test_oversized_message_is_fatal() {
        let mut client = Client::new(None);
        let hdr = MsgHeader {
            mtype: msg::CONNECT,
            len: msg::MAX_MSG_SIZE as u32 + 1,
            ..Default::default()
        };

        client.feed(&header_bytes(&hdr));

        assert!(client.next_message().is_err());
    }

    #[test]
    fn test_no_reply_sentinel_suppresses_output() {
        let mut client = Client::new(None);
        let hdr = MsgHeader {
            mtype: msg::PPPD_EVENT,
            len: msg::NO_REPLY,
            ..Default::default()
        };

        client.send_reply(&hdr, None, &[]);

        assert!(client.queued_output().is_empty());
    }

    #[test]
    fn test_event_carries_serviceid_tail() {
        let mut client = Client::new(None);

        client.send_event(3, 0x0800, 0, Some("net.ppp.l2tp"));

        let out = client.queued_output().to_vec();
        let hdr = MsgHeader::read(&out);
        assert_eq!(hdr.mtype, msg::EVENT);
        assert_eq!(hdr.result, 3);
        assert_eq!(hdr.cookie, 0x0800);
        assert!(hdr.has_serviceid());
        assert_eq!(hdr.link as usize, "net.ppp.l2tp".len());
        assert_eq!(&out[msg::HDR_SIZE..], b"net.ppp.l2tp");
    }

    #[test]
    fn test_notification_filters() {
        let (stream, _other) = UnixStream::pair().unwrap();
        let mut client = Client::new(None);
        client.open(0, stream);

        // No subscription yet
        assert!(!client.wants_notification(NOTIFY_EVENTS, "net.ppp", 1));

        // Unfiltered subscription matches everything of its kind
        client.notify_flags = NOTIFY_EVENTS;
        assert!(client.wants_notification(NOTIFY_EVENTS, "net.ppp", 1));
        assert!(!client.wants_notification(NOTIFY_STATUS, "net.ppp", 1));

        // Service-id filter wins over the link filter
        client.notify_serviceid = Some("net.ppp.l2tp".to_string());
        assert!(client.wants_notification(NOTIFY_EVENTS, "net.ppp.l2tp", 1));
        assert!(!client.wants_notification(NOTIFY_EVENTS, "net.ppp.other", 1));

        // Link filter alone
        client.notify_serviceid = None;
        client.notify_link = 7;
        assert!(client.wants_notification(NOTIFY_EVENTS, "net.ppp", 7));
        assert!(!client.wants_notification(NOTIFY_EVENTS, "net.ppp", 8));
    }

    #[test]
    fn test_closed_client_never_matches() {
        let mut client = Client::new(None);
        client.notify_flags = NOTIFY_EVENTS;
        assert!(!client.wants_notification(NOTIFY_EVENTS, "net.ppp", 1));
    }
}
