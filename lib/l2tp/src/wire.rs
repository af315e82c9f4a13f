//! L2TP wire format (RFC 2661). Pure encode/decode over byte slices; all
//! multi-byte fields are network order on the wire and host order in the
//! decoded representation.

use crate::support::{Error, ErrorType, Result};
use byteorder::{BigEndian, ByteOrder};

pub const UDP_PORT: u16 = 1701;

pub const FLAG_T: u16 = 0x8000;
pub const FLAG_L: u16 = 0x4000;
pub const FLAG_S: u16 = 0x0800;
pub const FLAG_O: u16 = 0x0200;
pub const FLAG_P: u16 = 0x0100;

pub const VERSION_MASK: u16 = 0x000F;
pub const VERSION: u16 = 2;

/// Control frames always carry length and sequence fields.
pub const CONTROL_HDR_SIZE: usize = 12;
/// Data header with the length field, before optional sequence fields.
pub const DATA_HDR_SIZE: usize = 8;

const CONTROL_FLAGS: u16 = FLAG_T | FLAG_L | FLAG_S | VERSION;

/// A decoded frame. Slices borrow from the input datagram; the payload has
/// already been truncated to the declared length, stripping link padding.
#[derive(Debug, Eq, PartialEq)]
pub enum Packet<'a> {
    Control {
        tunnel_id: u16,
        session_id: u16,
        ns: u16,
        nr: u16,
        body: &'a [u8],
    },
    /// Zero-length-body control frame: pure acknowledgement.
    Ack { tunnel_id: u16, nr: u16 },
    Data {
        tunnel_id: u16,
        session_id: u16,
        /// `(ns, nr)` when the peer sequences its data frames.
        seq: Option<(u16, u16)>,
        body: &'a [u8],
    },
}

pub fn decode(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 2 {
        return Err(Error::Fatal(ErrorType::Truncated));
    }

    let flags = BigEndian::read_u16(buf);
    if flags & VERSION_MASK != VERSION {
        return Err(Error::Fatal(ErrorType::Version));
    }

    if flags & FLAG_T != 0 {
        decode_control(flags, buf)
    } else {
        decode_data(flags, buf)
    }
}

/// Control frames must carry length and sequence fields and no offset.
fn decode_control(flags: u16, buf: &[u8]) -> Result<Packet> {
    if flags & FLAG_L == 0 || flags & FLAG_S == 0 || flags & FLAG_O != 0 {
        return Err(Error::Fatal(ErrorType::Flags));
    }

    if buf.len() < CONTROL_HDR_SIZE {
        return Err(Error::Fatal(ErrorType::Truncated));
    }

    let len = BigEndian::read_u16(&buf[2..]) as usize;
    if len < CONTROL_HDR_SIZE || len > buf.len() {
        return Err(Error::Fatal(ErrorType::Truncated));
    }

    let tunnel_id = BigEndian::read_u16(&buf[4..]);
    let session_id = BigEndian::read_u16(&buf[6..]);
    let ns = BigEndian::read_u16(&buf[8..]);
    let nr = BigEndian::read_u16(&buf[10..]);

    if len == CONTROL_HDR_SIZE {
        return Ok(Packet::Ack { tunnel_id, nr });
    }

    Ok(Packet::Control {
        tunnel_id,
        session_id,
        ns,
        nr,
        body: &buf[CONTROL_HDR_SIZE..len],
    })
}

fn decode_data(flags: u16, buf: &[u8]) -> Result<Packet> {
    // Truncate to the declared length up front when present
    let eff = if flags & FLAG_L != 0 {
        if buf.len() < 4 {
            return Err(Error::Fatal(ErrorType::Truncated));
        }
        let len = BigEndian::read_u16(&buf[2..]) as usize;
        if len > buf.len() {
            return Err(Error::Fatal(ErrorType::Truncated));
        }
        &buf[..len]
    } else {
        buf
    };

    let mut off = if flags & FLAG_L != 0 { 4 } else { 2 };

    if eff.len() < off + 4 {
        return Err(Error::Fatal(ErrorType::Truncated));
    }
    let tunnel_id = BigEndian::read_u16(&eff[off..]);
    let session_id = BigEndian::read_u16(&eff[off + 2..]);
    off += 4;

    let seq = if flags & FLAG_S != 0 {
        if eff.len() < off + 4 {
            return Err(Error::Fatal(ErrorType::Truncated));
        }
        let ns = BigEndian::read_u16(&eff[off..]);
        let nr = BigEndian::read_u16(&eff[off + 2..]);
        off += 4;
        Some((ns, nr))
    } else {
        None
    };

    if flags & FLAG_O != 0 {
        if eff.len() < off + 2 {
            return Err(Error::Fatal(ErrorType::Truncated));
        }
        let pad = BigEndian::read_u16(&eff[off..]) as usize;
        off += 2 + pad;
        if eff.len() < off {
            return Err(Error::Fatal(ErrorType::Truncated));
        }
    }

    Ok(Packet::Data {
        tunnel_id,
        session_id,
        seq,
        body: &eff[off..],
    })
}

/// Stamps the control header in place. The frame arrives from the PPP
/// engine with 12 bytes of header space in front; the session id within it
/// has already been filled by the caller and is left untouched.
pub fn stamp_control(frame: &mut [u8], peer_tunnel_id: u16, ns: u16, nr: u16) {
    debug_assert!(frame.len() >= CONTROL_HDR_SIZE);

    let frame_len = frame.len() as u16;
    BigEndian::write_u16(&mut frame[0..], CONTROL_FLAGS);
    BigEndian::write_u16(&mut frame[2..], frame_len);
    BigEndian::write_u16(&mut frame[4..], peer_tunnel_id);
    BigEndian::write_u16(&mut frame[8..], ns);
    BigEndian::write_u16(&mut frame[10..], nr);
}

/// Refreshes the acknowledgement field of an already stamped control frame.
/// Retransmission must not touch anything else.
#[inline]
pub fn restamp_nr(frame: &mut [u8], nr: u16) {
    BigEndian::write_u16(&mut frame[10..], nr);
}

/// Builds a zero-length-body acknowledgement.
pub fn ack(peer_tunnel_id: u16, ns: u16, nr: u16) -> [u8; CONTROL_HDR_SIZE] {
    let mut frame = [0u8; CONTROL_HDR_SIZE];

    BigEndian::write_u16(&mut frame[0..], CONTROL_FLAGS);
    BigEndian::write_u16(&mut frame[2..], CONTROL_HDR_SIZE as u16);
    BigEndian::write_u16(&mut frame[4..], peer_tunnel_id);
    BigEndian::write_u16(&mut frame[8..], ns);
    BigEndian::write_u16(&mut frame[10..], nr);

    frame
}

/// Builds the header prepended to an outbound data frame. `payload_len` is
/// the PPP payload length; the length field covers header plus payload.
pub fn data_header(peer_tunnel_id: u16, peer_session_id: u16, payload_len: usize, seq: Option<u16>) -> Vec<u8> {
    let hdr_len = DATA_HDR_SIZE + if seq.is_some() { 4 } else { 0 };
    let mut hdr = vec![0u8; hdr_len];

    let mut flags = FLAG_L | VERSION;
    if seq.is_some() {
        flags |= FLAG_S;
    }

    BigEndian::write_u16(&mut hdr[0..], flags);
    BigEndian::write_u16(&mut hdr[2..], (hdr_len + payload_len) as u16);
    BigEndian::write_u16(&mut hdr[4..], peer_tunnel_id);
    BigEndian::write_u16(&mut hdr[6..], peer_session_id);
    if let Some(ns) = seq {
        BigEndian::write_u16(&mut hdr[8..], ns);
        BigEndian::write_u16(&mut hdr[10..], 0);
    }

    hdr
}
