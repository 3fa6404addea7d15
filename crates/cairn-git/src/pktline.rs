//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length (prefix included),
//! or one of the sentinels `0000` (flush), `0001` (delimiter) and
//! `0002` (response end).

use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest encoded packet, length prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest payload a single data packet can carry.
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - 4;

/// Packet length limit when only the old `side-band` capability was negotiated.
pub const SIDEBAND_PKT_LEN: usize = 1000;

/// Side-band channel carrying pack data.
pub const BAND_DATA: u8 = 1;
/// Side-band channel carrying progress messages.
pub const BAND_PROGRESS: u8 = 2;
/// Side-band channel carrying a fatal error message.
pub const BAND_ERROR: u8 = 3;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Splits a payload into as few maximal data packets as possible.
    ///
    /// An empty payload yields a single empty packet.
    pub fn split_data(data: &[u8]) -> Vec<Self> {
        if data.is_empty() {
            return vec![Self::Data(Vec::new())];
        }
        data.chunks(MAX_PKT_PAYLOAD)
            .map(|chunk| Self::Data(chunk.to_vec()))
            .collect()
    }

    /// Appends the encoded packet to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Data(data) => {
                if data.len() > MAX_PKT_PAYLOAD {
                    return Err(GitError::ProtocolViolation(format!(
                        "pkt-line payload of {} bytes exceeds {}",
                        data.len(),
                        MAX_PKT_PAYLOAD
                    )));
                }
                out.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
                out.extend_from_slice(data);
            }
            Self::Flush => out.extend_from_slice(b"0000"),
            Self::Delimiter => out.extend_from_slice(b"0001"),
            Self::ResponseEnd => out.extend_from_slice(b"0002"),
        }
        Ok(())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data().map_or(4, |d| d.len() + 4));
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    ///
    /// Returns `None` on a clean end of input between packets. Running out
    /// of input inside a packet is a protocol violation.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(GitError::ProtocolViolation(
                        "unexpected end of input in pkt-line length".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !len_buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(GitError::ProtocolViolation(format!(
                "invalid pkt-line length {:?}",
                String::from_utf8_lossy(&len_buf)
            )));
        }
        let len = len_buf
            .iter()
            .fold(0usize, |acc, &b| acc * 16 + (b as char).to_digit(16).unwrap_or(0) as usize);

        match len {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delimiter)),
            2 => Ok(Some(PktLine::ResponseEnd)),
            3 => Err(GitError::ProtocolViolation(
                "pkt-line length 3 is reserved".to_string(),
            )),
            len if len > MAX_PKT_LEN => Err(GitError::ProtocolViolation(format!(
                "pkt-line length {} exceeds {}",
                len, MAX_PKT_LEN
            ))),
            len => {
                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        GitError::ProtocolViolation(
                            "unexpected end of input in pkt-line payload".to_string(),
                        )
                    } else {
                        GitError::Io(e)
                    }
                })?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet or end of input.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Concatenates consecutive data packets up to the next flush.
    ///
    /// Reverses [`PktLine::split_data`].
    pub fn read_joined(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Data(data)) => out.extend_from_slice(&data),
                Some(PktLine::Flush) | None => return Ok(out),
                Some(other) => {
                    return Err(GitError::ProtocolViolation(format!(
                        "unexpected {:?} inside joined data",
                        other
                    )))
                }
            }
        }
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
    sideband_len: usize,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sideband_len: MAX_PKT_LEN,
        }
    }

    /// Limits side-band packets to `len` bytes, prefix included.
    pub fn set_sideband_len(&mut self, len: usize) {
        self.sideband_len = len.clamp(6, MAX_PKT_LEN);
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Writes a delimiter packet.
    pub fn delim_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Delimiter)
    }

    /// Writes an `ERR <msg>` line, which clients show as a fatal error.
    pub fn write_error(&mut self, msg: &str) -> Result<()> {
        self.write_line(&format!("ERR {}", msg))
    }

    /// Writes `data` on a side-band channel, split across as many packets
    /// as the negotiated packet size requires.
    pub fn write_sideband(&mut self, band: u8, data: &[u8]) -> Result<()> {
        let chunk_len = self.sideband_len - 5;
        for chunk in data.chunks(chunk_len) {
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(band);
            payload.extend_from_slice(chunk);
            self.write(&PktLine::Data(payload))?;
        }
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn read_all(buf: Vec<u8>) -> Result<Vec<PktLine>> {
        let mut reader = PktLineReader::new(Cursor::new(buf));
        let mut out = Vec::new();
        while let Some(pkt) = reader.read()? {
            out.push(pkt);
        }
        Ok(out)
    }

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode().unwrap(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
        assert_eq!(PktLine::Delimiter.encode().unwrap(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode().unwrap(), b"0002");
    }

    #[test]
    fn test_pktline_roundtrip() {
        let packets = vec![
            PktLine::from_string("hello\n"),
            PktLine::from_string("world\n"),
            PktLine::Delimiter,
            PktLine::Flush,
        ];

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for pkt in &packets {
                writer.write(pkt).unwrap();
            }
        }

        assert_eq!(read_all(buf).unwrap(), packets);
    }

    #[test]
    fn test_pktline_payload_boundaries() {
        for len in [0, 1, MAX_PKT_PAYLOAD] {
            let pkt = PktLine::Data(vec![b'x'; len]);
            let encoded = pkt.encode().unwrap();
            assert_eq!(encoded.len(), len + 4);
            assert_eq!(read_all(encoded).unwrap(), vec![pkt]);
        }
        assert_eq!(
            &PktLine::Data(vec![0; MAX_PKT_PAYLOAD]).encode().unwrap()[..4],
            b"fff0"
        );
    }

    #[test]
    fn test_pktline_oversized_payload_rejected() {
        let pkt = PktLine::Data(vec![b'x'; MAX_PKT_PAYLOAD + 1]);
        assert!(matches!(
            pkt.encode(),
            Err(GitError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_split_and_join() {
        let data: Vec<u8> = (0..MAX_PKT_PAYLOAD + 1).map(|i| (i % 251) as u8).collect();
        let lines = PktLine::split_data(&data);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].data().unwrap().len(), MAX_PKT_PAYLOAD);
        assert_eq!(lines[1].data().unwrap().len(), 1);

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for line in &lines {
                writer.write(line).unwrap();
            }
            writer.flush_pkt().unwrap();
        }
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(reader.read_joined().unwrap(), data);
    }

    #[test]
    fn test_split_empty() {
        assert_eq!(PktLine::split_data(&[]), vec![PktLine::Data(Vec::new())]);
    }

    #[test]
    fn test_pktline_read_invalid_length() {
        for bad in [&b"0003"[..], b"zzzz", b"+fff", b"fff1", b"ffff"] {
            let mut reader = PktLineReader::new(Cursor::new(bad.to_vec()));
            assert!(
                matches!(reader.read(), Err(GitError::ProtocolViolation(_))),
                "{:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_pktline_truncated_prefix() {
        let mut reader = PktLineReader::new(Cursor::new(b"00".to_vec()));
        assert!(matches!(
            reader.read(),
            Err(GitError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_pktline_truncated_payload() {
        let mut reader = PktLineReader::new(Cursor::new(b"000ahel".to_vec()));
        assert!(matches!(
            reader.read(),
            Err(GitError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_pktline_read_eof_on_empty() {
        let mut reader = PktLineReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_pktline_read_until_flush() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("line1").unwrap();
            writer.write_line("line2").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("line3").unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let packets = reader.read_until_flush().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(reader.read().unwrap().unwrap().as_str(), Some("line3"));
    }

    #[test]
    fn test_pktline_as_str() {
        assert_eq!(PktLine::from_string("hello\n").as_str(), Some("hello"));
        assert_eq!(PktLine::from_string("no newline").as_str(), Some("no newline"));
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
        assert!(PktLine::Flush.as_str().is_none());
    }

    #[test]
    fn test_pktline_writer_write_line() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("test").unwrap();
            writer.write_line("test\n").unwrap();
        }
        // "test\n" is 5 bytes, + 4 for length = 9, written twice
        assert_eq!(buf, b"0009test\n0009test\n");
    }

    #[test]
    fn test_pktline_write_error() {
        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf)
            .write_error("not our ref")
            .unwrap();
        assert_eq!(buf, b"0014ERR not our ref\n");
    }

    #[test]
    fn test_sideband_splits_large_payload() {
        let data = vec![7u8; 2500];
        let mut writer = PktLineWriter::new(Vec::new());
        writer.set_sideband_len(SIDEBAND_PKT_LEN);
        writer.write_sideband(BAND_DATA, &data).unwrap();

        let packets = read_all(writer.into_inner()).unwrap();
        assert_eq!(packets.len(), 3);
        let mut joined = Vec::new();
        for pkt in &packets {
            let payload = pkt.data().unwrap();
            assert!(payload.len() + 4 <= SIDEBAND_PKT_LEN);
            assert_eq!(payload[0], BAND_DATA);
            joined.extend_from_slice(&payload[1..]);
        }
        assert_eq!(joined, data);
    }

    proptest! {
        #[test]
        fn prop_reader_never_panics(input in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = read_all(input);
        }

        #[test]
        fn prop_split_join_roundtrip(data in prop::collection::vec(any::<u8>(), 0..200_000)) {
            let mut buf = Vec::new();
            for line in PktLine::split_data(&data) {
                line.encode_into(&mut buf).unwrap();
            }
            buf.extend_from_slice(b"0000");
            let mut reader = PktLineReader::new(Cursor::new(buf));
            prop_assert_eq!(reader.read_joined().unwrap(), data);
        }
    }
}
