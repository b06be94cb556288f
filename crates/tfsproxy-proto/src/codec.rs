//! Packet framing
//!
//! Every message starts with a fixed 24-byte header followed by `len`
//! payload bytes. All integers are little-endian and packed.
//!
//! ```text
//! +-----------+---------+----------+-------------+---------+----------+
//! | flag: u32 | len:u32 | type:u16 | version:u16 | id: u64 | crc: u32 |
//! +-----------+---------+----------+-------------+---------+----------+
//! ```
//!
//! The CRC covers the payload only and is seeded with the flag value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tfsproxy_common::checksum::{CRC_SEED, ProtocolCrc};
use tfsproxy_common::{Error, Result, ServerAddr};

/// Size of the packet header in bytes
pub const HEADER_SIZE: usize = 24;

/// Constant packet flag ("TFSN")
pub const PACKET_FLAG: u32 = 0x4E53_4654;

/// Protocol version written into every header
pub const PACKET_VERSION: u16 = 2;

/// Upper bound for a payload; anything larger is treated as a corrupt header
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

const PACKET_ID_WRAP: u64 = i32::MAX as u64 - 1;

static PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-wide packet id.
///
/// Ids start at 2 and wrap back to 1 before reaching `i32::MAX - 1`.
pub fn next_packet_id() -> u64 {
    let mut current = PACKET_ID.load(Ordering::Relaxed);
    loop {
        let next = if current >= PACKET_ID_WRAP { 1 } else { current + 1 };
        match PACKET_ID.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

/// Message type code carried in the header
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const STATUS: Self = Self(1);
    pub const GET_BLOCK_INFO: Self = Self(2);
    pub const SET_BLOCK_INFO: Self = Self(3);
    pub const READ_DATA: Self = Self(7);
    pub const RESP_READ_DATA: Self = Self(8);
    pub const WRITE_DATA: Self = Self(9);
    pub const CLOSE_FILE: Self = Self(10);
    pub const UNLINK_FILE: Self = Self(11);
    pub const FILE_INFO: Self = Self(17);
    pub const RESP_FILE_INFO: Self = Self(18);
    pub const CLIENT_CMD: Self = Self(20);
    pub const CREATE_FILENAME: Self = Self(21);
    pub const RESP_CREATE_FILENAME: Self = Self(22);
    pub const READ_DATA_V2: Self = Self(38);
    pub const RESP_READ_DATA_V2: Self = Self(39);
    pub const BATCH_GET_BLOCK_INFO: Self = Self(59);
    pub const BATCH_SET_BLOCK_INFO: Self = Self(60);
    pub const REQ_RC_LOGIN: Self = Self(66);
    pub const RSP_RC_LOGIN: Self = Self(67);
    pub const REQ_RC_KEEPALIVE: Self = Self(68);
    pub const RSP_RC_KEEPALIVE: Self = Self(69);
    pub const REQ_RC_LOGOUT: Self = Self(70);
    pub const FILEPATH_ACTION: Self = Self(74);
    pub const WRITE_FILEPATH: Self = Self(75);
    pub const READ_FILEPATH: Self = Self(76);
    pub const RESP_READ_FILEPATH: Self = Self(77);
    pub const LS_FILEPATH: Self = Self(78);
    pub const RESP_LS_FILEPATH: Self = Self(79);
    pub const REQ_RT_GET_TABLE: Self = Self(84);
    pub const RSP_RT_GET_TABLE: Self = Self(85);
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.0)
    }
}

/// Decoded packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub flag: u32,
    pub len: u32,
    pub msg_type: MessageType,
    pub version: u16,
    pub id: u64,
    pub crc: u32,
}

/// Result of an incremental decode attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// This many more bytes are required before anything can be decoded
    NeedMore(usize),
    Complete(T),
}

impl Header {
    /// Header for `payload` with a fresh packet id and computed CRC
    #[must_use]
    pub fn for_payload(msg_type: MessageType, payload: &[u8]) -> Self {
        let mut crc = ProtocolCrc::with_seed(CRC_SEED);
        crc.update(payload);
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        Self {
            flag: PACKET_FLAG,
            len,
            msg_type,
            version: PACKET_VERSION,
            id: next_packet_id(),
            crc: crc.value(),
        }
    }

    /// Append the encoded header to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.flag);
        buf.put_u32_le(self.len);
        buf.put_u16_le(self.msg_type.0);
        buf.put_u16_le(self.version);
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.crc);
    }

    /// Decode a header from the start of `data`.
    ///
    /// A short buffer reports how many bytes are still missing rather than
    /// failing.
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>> {
        if data.len() < HEADER_SIZE {
            return Ok(Decoded::NeedMore(HEADER_SIZE - data.len()));
        }

        let mut buf = &data[..HEADER_SIZE];
        let flag = buf.get_u32_le();
        if flag != PACKET_FLAG {
            return Err(Error::decode(format!("invalid packet flag: {flag:#010x}")));
        }
        let len = buf.get_u32_le();
        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::decode(format!("payload too large: {len}")));
        }
        let msg_type = MessageType(buf.get_u16_le());
        let version = buf.get_u16_le();
        let id = buf.get_u64_le();
        let crc = buf.get_u32_le();

        Ok(Decoded::Complete(Self {
            flag,
            len,
            msg_type,
            version,
            id,
            crc,
        }))
    }

    /// Total packet size (header plus payload)
    #[must_use]
    pub const fn total_len(&self) -> usize {
        HEADER_SIZE + self.len as usize
    }

    /// Check the header CRC against a payload
    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        let mut crc = ProtocolCrc::with_seed(CRC_SEED);
        crc.update(payload);
        if crc.value() == self.crc {
            Ok(())
        } else {
            Err(Error::Corrupted(format!(
                "packet crc mismatch: header {:#010x}, payload {:#010x}",
                self.crc,
                crc.value()
            )))
        }
    }
}

/// A received packet: header plus payload
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    /// Split one complete packet off the front of `buf`
    pub fn decode(buf: &mut BytesMut) -> Result<Decoded<Self>> {
        let header = match Header::decode(buf)? {
            Decoded::Complete(header) => header,
            Decoded::NeedMore(n) => return Ok(Decoded::NeedMore(n)),
        };
        if buf.len() < header.total_len() {
            return Ok(Decoded::NeedMore(header.total_len() - buf.len()));
        }
        buf.advance(HEADER_SIZE);
        let body = buf.split_to(header.len as usize).freeze();
        Ok(Decoded::Complete(Self { header, body }))
    }

    #[must_use]
    pub const fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    #[must_use]
    pub fn is_status(&self) -> bool {
        self.header.msg_type == MessageType::STATUS
    }

    /// Fail unless the packet has the expected type
    pub fn expect(&self, msg_type: MessageType) -> Result<()> {
        if self.header.msg_type == msg_type {
            Ok(())
        } else {
            Err(Error::decode(format!(
                "unexpected message type {:?}, wanted {msg_type:?}",
                self.header.msg_type
            )))
        }
    }

    /// Cursor over the payload
    #[must_use]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.body)
    }
}

/// Builds one outgoing packet.
///
/// Fields are appended to the payload and [`PacketBuilder::finish`] prefixes
/// the header with the final length and CRC.
#[derive(Debug)]
pub struct PacketBuilder {
    msg_type: MessageType,
    payload: BytesMut,
}

impl PacketBuilder {
    #[must_use]
    pub fn new(msg_type: MessageType) -> Self {
        Self::with_capacity(msg_type, 64)
    }

    #[must_use]
    pub fn with_capacity(msg_type: MessageType, capacity: usize) -> Self {
        Self {
            msg_type,
            payload: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.payload.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.payload.put_u16_le(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.payload.put_u32_le(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.payload.put_i32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.payload.put_u64_le(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.payload.put_i64_le(v);
        self
    }

    pub fn put_slice(&mut self, v: &[u8]) -> &mut Self {
        self.payload.put_slice(v);
        self
    }

    pub fn put_addr(&mut self, addr: ServerAddr) -> &mut Self {
        self.put_u64(addr.raw())
    }

    /// Length-prefixed string with a trailing NUL counted in the length
    pub fn put_cstr(&mut self, s: &str) -> &mut Self {
        #[allow(clippy::cast_possible_truncation)]
        self.put_u32(s.len() as u32 + 1);
        self.payload.put_slice(s.as_bytes());
        self.payload.put_u8(0);
        self
    }

    /// Length-prefixed string where an empty string is sent as a bare zero
    pub fn put_opt_cstr(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            self.put_u32(0)
        } else {
            self.put_cstr(s)
        }
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Produce the ready-to-send packet
    #[must_use]
    pub fn finish(self) -> Bytes {
        let header = Header::for_payload(self.msg_type, &self.payload);
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        header.encode(&mut out);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    /// Produce a decoded frame directly, as a peer would receive it
    #[must_use]
    pub fn into_frame(self) -> Frame {
        let header = Header::for_payload(self.msg_type, &self.payload);
        Frame {
            header,
            body: self.payload.freeze(),
        }
    }
}

/// Bounds-checked little-endian cursor over a payload
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not consumed yet
    #[must_use]
    pub const fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.len() < n {
            return Err(Error::decode(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    /// Entry count of a list whose entries take at least `min_entry_size`
    /// bytes each. A count the remaining payload cannot hold is rejected.
    pub fn count(&mut self, min_entry_size: usize, what: &str) -> Result<u32> {
        let count = self.u32()?;
        let fits = (count as usize)
            .checked_mul(min_entry_size)
            .is_some_and(|n| n <= self.buf.len());
        if !fits {
            return Err(Error::decode(format!(
                "{what} count {count} exceeds the {} bytes left",
                self.buf.len()
            )));
        }
        Ok(count)
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub fn addr(&mut self) -> Result<ServerAddr> {
        Ok(ServerAddr::from_raw(self.u64()?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "bytes")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Length-prefixed string; the length includes a trailing NUL that is
    /// stripped. A zero length yields an empty string.
    pub fn cstr(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let raw = self.bytes(len)?;
        let text = raw.strip_suffix(&[0]).unwrap_or(raw);
        Ok(String::from_utf8_lossy(text).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfsproxy_common::tfs_crc;

    #[test]
    fn test_header_round_trip() {
        let payload = b"block location payload";
        let header = Header::for_payload(MessageType::GET_BLOCK_INFO, payload);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let Decoded::Complete(decoded) = Header::decode(&buf).unwrap() else {
            panic!("header should be complete");
        };
        assert_eq!(decoded, header);
        assert_eq!(decoded.crc, tfs_crc(PACKET_FLAG, payload));
        assert_eq!(decoded.total_len(), HEADER_SIZE + payload.len());

        let mut again = BytesMut::new();
        decoded.encode(&mut again);
        assert_eq!(again, buf);
        decoded.verify(payload).unwrap();
        assert!(decoded.verify(b"other").is_err());
    }

    #[test]
    fn test_header_need_more() {
        let header = Header::for_payload(MessageType::STATUS, &[]);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        for n in 0..HEADER_SIZE {
            assert_eq!(
                Header::decode(&buf[..n]).unwrap(),
                Decoded::NeedMore(HEADER_SIZE - n)
            );
        }
    }

    #[test]
    fn test_header_bad_flag() {
        let mut buf = BytesMut::new();
        Header::for_payload(MessageType::STATUS, &[]).encode(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(Header::decode(&buf), Err(Error::Decode(_))));
    }

    #[test]
    fn test_frame_decode_partial() {
        let mut b = PacketBuilder::new(MessageType::CLIENT_CMD);
        b.put_i32(6).put_i64(0).put_i32(20);
        let packet = b.finish();

        let mut buf = BytesMut::from(&packet[..HEADER_SIZE + 3]);
        assert!(
            !Frame::decode(&mut buf).unwrap().is_complete(),
            "partial body must not decode"
        );
        buf.extend_from_slice(&packet[HEADER_SIZE + 3..]);
        buf.extend_from_slice(b"next");

        let Decoded::Complete(frame) = Frame::decode(&mut buf).unwrap() else {
            panic!("frame should be complete");
        };
        assert_eq!(frame.msg_type(), MessageType::CLIENT_CMD);
        assert_eq!(frame.body.len(), 16);
        frame.header.verify(&frame.body).unwrap();
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_packet_id_monotonic() {
        let a = next_packet_id();
        let b = next_packet_id();
        assert!(b > a || b == 1);
        assert!(a >= 1);
    }

    #[test]
    fn test_reader_bounds() {
        let mut b = PacketBuilder::new(MessageType::STATUS);
        b.put_cstr("hello").put_u64(7);
        let frame = b.into_frame();

        let mut r = frame.reader();
        assert_eq!(r.cstr().unwrap(), "hello");
        assert_eq!(r.u64().unwrap(), 7);
        assert!(r.is_empty());
        assert!(matches!(r.u8(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_reader_count() {
        let mut b = PacketBuilder::new(MessageType::STATUS);
        b.put_u32(2).put_u64(1).put_u64(2);
        let frame = b.into_frame();
        assert_eq!(frame.reader().count(8, "entry").unwrap(), 2);
        assert!(matches!(frame.reader().count(9, "entry"), Err(Error::Decode(_))));

        let mut b = PacketBuilder::new(MessageType::STATUS);
        b.put_u32(u32::MAX);
        let frame = b.into_frame();
        assert!(matches!(frame.reader().count(usize::MAX, "entry"), Err(Error::Decode(_))));
    }

    impl<T> Decoded<T> {
        fn is_complete(&self) -> bool {
            matches!(self, Self::Complete(_))
        }
    }
}
