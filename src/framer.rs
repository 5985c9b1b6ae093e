//! Packet framing over a byte stream.
//!
//! A packet is a run of bytes terminated by a single delimiter byte
//! (newline by default). The delimiter stays attached to the packet since
//! it is stored in the log and echoed back verbatim.
//!
//! TCP gives no message boundaries, so a packet may arrive split across any
//! number of reads. `Framer` keeps the unterminated tail between reads and
//! scans new bytes appended behind it.

use bytes::{Bytes, BytesMut};

/// Packet delimiter used on the wire.
pub const DELIMITER: u8 = b'\n';

/// Find the end of the first complete packet in `buf`.
///
/// Returns the packet length including its delimiter, or `None` when no
/// delimiter is present and the whole buffer is still pending.
pub fn find_packet_end(buf: &[u8], delimiter: u8) -> Option<usize> {
    buf.iter().position(|&b| b == delimiter).map(|pos| pos + 1)
}

/// Per-connection framing state.
///
/// Bytes are read straight into the framer's buffer (see [`Framer::read_buf`]),
/// so the pending remainder of the previous read is always in front of the
/// newly received bytes.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    delimiter: u8,
    /// Minimum free space guaranteed before each read.
    chunk_size: usize,
    /// Prefix of `buffer` already known to contain no delimiter.
    scanned: usize,
}

impl Framer {
    /// Create a framer that reads in chunks of at least `chunk_size` bytes.
    pub fn new(delimiter: u8, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            buffer: BytesMut::with_capacity(chunk_size),
            delimiter,
            chunk_size,
            scanned: 0,
        }
    }

    /// Buffer to receive the next chunk into.
    ///
    /// Spare capacity is topped up to at least one chunk. When the pending
    /// remainder outgrows the allocation the buffer doubles.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        let spare = self.buffer.capacity() - self.buffer.len();
        if spare < self.chunk_size {
            let additional = self.buffer.len().max(self.chunk_size);
            self.buffer.reserve(additional);
        }
        &mut self.buffer
    }

    /// Take the next complete packet, delimiter included.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        match find_packet_end(&self.buffer[self.scanned..], self.delimiter) {
            Some(end) => {
                let packet = self.buffer.split_to(self.scanned + end).freeze();
                self.scanned = 0;
                Some(packet)
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    /// Bytes received but not yet terminated.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Single-pass split of a whole buffer, used as the reference result.
    fn split_packets(buf: &[u8], delimiter: u8) -> (Vec<&[u8]>, &[u8]) {
        let mut packets = Vec::new();
        let mut rest = buf;
        while let Some(end) = find_packet_end(rest, delimiter) {
            let (packet, tail) = rest.split_at(end);
            packets.push(packet);
            rest = tail;
        }
        (packets, rest)
    }

    fn feed(framer: &mut Framer, bytes: &[u8]) {
        framer.read_buf().extend_from_slice(bytes);
    }

    fn drain(framer: &mut Framer) -> Vec<Bytes> {
        std::iter::from_fn(|| framer.next_packet()).collect()
    }

    #[test]
    fn test_find_packet_end() {
        assert_eq!(find_packet_end(b"hello\nworld", b'\n'), Some(6));
        assert_eq!(find_packet_end(b"\nrest", b'\n'), Some(1));
        assert_eq!(find_packet_end(b"no delimiter", b'\n'), None);
        assert_eq!(find_packet_end(b"", b'\n'), None);
    }

    #[test]
    fn test_split_packets() {
        let (packets, rest) = split_packets(b"a\nbb\n\nccc", b'\n');
        assert_eq!(packets, vec![&b"a\n"[..], &b"bb\n"[..], &b"\n"[..]]);
        assert_eq!(rest, b"ccc");
    }

    #[test]
    fn test_delimiter_first_byte() {
        let mut framer = Framer::new(DELIMITER, 16);
        feed(&mut framer, b"\nabc");
        assert_eq!(framer.next_packet().as_deref(), Some(&b"\n"[..]));
        assert_eq!(framer.next_packet(), None);
        assert_eq!(framer.pending(), b"abc");
    }

    #[test]
    fn test_no_delimiter_stays_pending() {
        let mut framer = Framer::new(DELIMITER, 16);
        feed(&mut framer, b"partial");
        assert!(drain(&mut framer).is_empty());
        assert_eq!(framer.pending(), b"partial");
    }

    #[test]
    fn test_multiple_packets_one_read() {
        let mut framer = Framer::new(DELIMITER, 16);
        feed(&mut framer, b"one\ntwo\nthree\nfo");
        let packets = drain(&mut framer);
        assert_eq!(packets, vec!["one\n", "two\n", "three\n"]);
        assert_eq!(framer.pending(), b"fo");
    }

    #[test]
    fn test_packet_split_across_reads() {
        let mut framer = Framer::new(DELIMITER, 16);
        feed(&mut framer, b"ab");
        assert_eq!(framer.next_packet(), None);
        feed(&mut framer, b"c\n");
        assert_eq!(framer.next_packet().as_deref(), Some(&b"abc\n"[..]));
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_read_buf_grows() {
        let mut framer = Framer::new(DELIMITER, 4);
        for _ in 0..10 {
            let buf = framer.read_buf();
            assert!(buf.capacity() - buf.len() >= 4);
            buf.extend_from_slice(b"xxxx");
            assert_eq!(framer.next_packet(), None);
        }
        assert_eq!(framer.pending().len(), 40);

        feed(&mut framer, b"\n");
        let packet = framer.next_packet().unwrap();
        assert_eq!(packet.len(), 41);
    }

    #[test]
    fn test_custom_delimiter() {
        let mut framer = Framer::new(b';', 8);
        feed(&mut framer, b"a;b\n;");
        assert_eq!(drain(&mut framer), vec!["a;", "b\n;"]);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_packets(
            stream in proptest::collection::vec(prop_oneof![Just(b'\n'), b'a'..=b'e'], 0..256),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..16),
        ) {
            let (expected, expected_rest) = split_packets(&stream, DELIMITER);

            let mut offsets: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
            offsets.push(0);
            offsets.push(stream.len());
            offsets.sort_unstable();

            let mut framer = Framer::new(DELIMITER, 3);
            let mut packets = Vec::new();
            for window in offsets.windows(2) {
                framer.read_buf().extend_from_slice(&stream[window[0]..window[1]]);
                packets.extend(drain(&mut framer));
            }

            let packets: Vec<&[u8]> = packets.iter().map(|p| &p[..]).collect();
            prop_assert_eq!(packets, expected);
            prop_assert_eq!(framer.pending(), expected_rest);
        }
    }
}
