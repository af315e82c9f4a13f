//! A bounded FIFO byte buffer stitching partial reads and writes across
//! reactor iterations. Data is appended at the tail and consumed from the
//! head; the head offset is compacted away periodically.

use std::io;

const COMPACT_THRESHOLD: usize = 4096;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(size.min(COMPACT_THRESHOLD)),
            head: 0,
            size,
        }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.len()
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Appends bytes at the tail. Panics if the buffer cannot hold them;
    /// callers check `free_capacity` first.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.len() > self.free_capacity() {
            panic!(
                "Buffer overrun: appending {} bytes to {} free",
                bytes.len(),
                self.free_capacity()
            );
        }
        self.data.extend_from_slice(bytes);
    }

    /// Drops `count` consumed bytes from the head.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "Consuming past the buffered data");
        self.head += count;

        if self.head >= COMPACT_THRESHOLD && self.head * 2 >= self.data.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Reads from `reader` until it would block or the buffer fills.
    /// A reader at end-of-file surfaces as `UnexpectedEof` so the caller
    /// can tear the connection down.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;

        loop {
            let room = self.free_capacity();
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
            }

            let want = room.min(chunk.len());
            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the buffered data to `writer` until everything is out or the
    /// writer would block. Consumed bytes are dropped from the head.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io;

    /// Stream stand-in handing out data in fixed-size chunks and blocking
    /// when drained or full.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip_in_chunks() {
        let payload: Vec<u8> = (0..2000u32).map(|item| item as u8).collect();
        let mut source = MockChannel::new(payload.clone(), 128, 0);
        let mut buffer = Buffer::new(4096);

        let count = buffer.ingress(&mut source).unwrap();
        assert_eq!(count, payload.len());
        assert_eq!(buffer.read_slice(), &payload[..]);

        let mut sink = MockChannel::new(Vec::new(), 128, payload.len());
        let count = buffer.egress(&mut sink).unwrap();
        assert_eq!(count, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.data, payload);
    }

    #[test]
    fn test_partial_egress_leaves_tail() {
        let mut buffer = Buffer::new(4096);
        buffer.append(&[7u8; 100]);

        let mut sink = MockChannel::new(Vec::new(), 64, 30);
        let count = buffer.egress(&mut sink).unwrap();

        assert_eq!(count, 30);
        assert_eq!(buffer.len(), 70);
    }

    #[test]
    fn test_ingress_eof_is_an_error() {
        let mut buffer = Buffer::new(4096);
        let mut source = io::Cursor::new(vec![1u8, 2, 3]);

        // The cursor returns 0 after its data, which reads as a closed peer
        let result = buffer.ingress(&mut source);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_overrun() {
        let mut buffer = Buffer::new(8);
        let mut source = MockChannel::new(vec![0u8; 64], 8, 0);

        let result = buffer.ingress(&mut source);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_consume_and_compact() {
        let mut buffer = Buffer::new(64 * 1024);
        buffer.append(&vec![9u8; 10000]);

        buffer.consume(6000);
        assert_eq!(buffer.len(), 4000);
        assert_eq!(buffer.read_slice()[0], 9);

        // Head offset was folded away; capacity accounting unchanged
        buffer.append(&[1, 2, 3]);
        assert_eq!(buffer.len(), 4003);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_append_past_capacity_panics() {
        let mut buffer = Buffer::new(4);
        buffer.append(&[0u8; 5]);
    }
}
