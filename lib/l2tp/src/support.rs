use std::io;
use std::net::SocketAddr;

/// Terminal failure kinds. Each maps onto an errno-style code for the
/// control-protocol boundary.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Version nibble is not 2.
    Version,
    /// Flag combination forbidden on this frame kind.
    Flags,
    /// Frame shorter than its declared length, or shorter than its header.
    Truncated,
    /// Operation on a tunnel in its post-teardown linger.
    Closed,
    InvalidArg,
    AddrInUse,
    /// No endpoint attached where one is required.
    NoEndpoint,
    Io(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// The operation cannot make progress right now; retry on readiness.
    Wait,
    Fatal(ErrorType),
}

impl Error {
    /// Errno-style code surfaced over the client control protocol.
    #[inline]
    pub fn errno(&self) -> u32 {
        let code = match self {
            Error::Wait => libc::EAGAIN,
            Error::Fatal(ErrorType::Closed) => libc::ENXIO,
            Error::Fatal(ErrorType::InvalidArg) => libc::EINVAL,
            Error::Fatal(ErrorType::AddrInUse) => libc::EADDRINUSE,
            Error::Fatal(ErrorType::NoEndpoint) => libc::ENOTCONN,
            Error::Fatal(_) => libc::EIO,
        };

        code as u32
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => Error::Wait,
            io::ErrorKind::AddrInUse => Error::Fatal(ErrorType::AddrInUse),
            kind => Error::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Opaque reference to the structure hosting a tunnel. The engine never
/// dereferences it; it is handed back verbatim on every up-call.
pub type HostId = u32;

/// Events surfaced to a tunnel's host.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    /// Retransmission retries exhausted; the owner should abandon the call.
    ReliableFailed,
    /// Data-plane sequence violation.
    InputError,
    /// Transmit path is congested.
    XmitFull,
    /// Transmit path drained again.
    XmitOk,
}

/// Host verdict on a delivered frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verdict {
    Accepted,
    /// Host buffer full; the engine must not advance past this frame.
    Refused,
}

/// Up-call interface between the engine and whatever hosts its tunnels.
/// A single dispatcher object resolves the `HostId` tag to the concrete
/// per-tunnel owner.
pub trait TunnelHost {
    /// A frame arrived for the host. Control frames are delivered with
    /// their L2TP header, data frames without. Returning `Refused` stops
    /// in-order delivery at this frame.
    fn on_input(
        &mut self,
        host: HostId,
        payload: &[u8],
        from: Option<SocketAddr>,
        is_control: bool,
    ) -> Verdict;

    /// An asynchronous condition on the tunnel.
    fn on_event(&mut self, host: HostId, event: Event, aux: u32);
}
