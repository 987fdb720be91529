//! Wire format for the session protocol.
//!
//! Every stream starts with a banner and an address exchange, then carries
//! a sequence of tag-prefixed frames. All integers are little-endian.
//!
//! ```text
//! MSG frame:
//!   [tag:1][header:53][front][middle][data][footer:21]
//!
//! header:
//!   seq:8 tid:8 type:2 priority:2 version:2 front_len:4 middle_len:4
//!   data_len:4 data_off:2 src_type:1 src_num:8 compat_version:2
//!   reserved:2 crc:4            (crc = CRC32C of the preceding 49 bytes)
//!
//! footer:
//!   front_crc:4 middle_crc:4 data_crc:4 sig:8 flags:1
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::msg::types::{EntityAddr, EntityName, EntityType};

/// Sent by both sides first on every stream.
pub const BANNER: &[u8; 9] = b"smsgr 001";

/// Version carried in connect requests and replies.
pub const PROTOCOL_VERSION: u32 = 1;

pub const HEADER_LEN: usize = 53;
pub const FOOTER_LEN: usize = 21;
pub const CONNECT_REQUEST_LEN: usize = 25;
pub const CONNECT_REPLY_LEN: usize = 26;
pub const ADDR_LEN: usize = 28;
pub const STAMP_LEN: usize = 8;

/// Feature bits negotiated during the handshake.
pub mod features {
    /// Reconnects exchange acknowledged sequence numbers (`SEQ` reply).
    pub const RECONNECT_SEQ: u64 = 1 << 0;
    /// Timestamped keepalives with acknowledgement.
    pub const KEEPALIVE2: u64 = 1 << 1;

    pub const SUPPORTED: u64 = RECONNECT_SEQ | KEEPALIVE2;
}

/// Connect request/reply flag: the sender's policy toward the receiver is lossy.
pub const CONNECT_LOSSY: u8 = 1;
/// Connect request flag: the sender acts as a server toward the receiver.
pub const CONNECT_SERVER: u8 = 2;

/// Footer flag: the message was completely written.
pub const FOOTER_COMPLETE: u8 = 1;
/// Footer flag: the data region carries no CRC.
pub const FOOTER_NOCRC: u8 = 2;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// Frame and handshake tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Ready = 1,
    ResetSession = 2,
    Wait = 3,
    RetrySession = 4,
    RetryGlobal = 5,
    Close = 6,
    Msg = 7,
    Ack = 8,
    Keepalive = 9,
    BadProtoVer = 10,
    BadAuthorizer = 11,
    Features = 12,
    Seq = 13,
    Keepalive2 = 14,
    Keepalive2Ack = 15,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Tag::Ready,
            2 => Tag::ResetSession,
            3 => Tag::Wait,
            4 => Tag::RetrySession,
            5 => Tag::RetryGlobal,
            6 => Tag::Close,
            7 => Tag::Msg,
            8 => Tag::Ack,
            9 => Tag::Keepalive,
            10 => Tag::BadProtoVer,
            11 => Tag::BadAuthorizer,
            12 => Tag::Features,
            13 => Tag::Seq,
            14 => Tag::Keepalive2,
            15 => Tag::Keepalive2Ack,
            _ => return None,
        })
    }
}

/// Wire decoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough bytes to parse the structure.
    #[error("truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// The header checksum does not match its contents.
    #[error("header crc mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderCrc { expected: u32, actual: u32 },

    /// A payload region checksum does not match its contents.
    #[error("{region} crc mismatch: expected {expected:#010x}, got {actual:#010x}")]
    PayloadCrc {
        region: &'static str,
        expected: u32,
        actual: u32,
    },

    /// The sender marked the message as not completely written.
    #[error("message aborted by sender")]
    Aborted,

    /// Declared payload exceeds the configured maximum.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    /// The peer did not open with our banner.
    #[error("bad banner")]
    BadBanner,

    /// A tag byte outside the protocol.
    #[error("unknown tag {0}")]
    UnknownTag(u8),

    /// An entity type byte outside the protocol.
    #[error("unknown entity type {0}")]
    UnknownEntityType(u8),

    /// An address family we cannot represent.
    #[error("unsupported address family {0}")]
    BadAddressFamily(u16),
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub seq: u64,
    pub tid: u64,
    pub msg_type: u16,
    pub priority: u16,
    pub version: u16,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    pub data_off: u16,
    pub src: EntityName,
    pub compat_version: u16,
    pub reserved: u16,
    pub crc: u32,
}

impl MessageHeader {
    pub fn new(msg_type: u16, src: EntityName) -> Self {
        Self {
            seq: 0,
            tid: 0,
            msg_type,
            priority: 0,
            version: 1,
            front_len: 0,
            middle_len: 0,
            data_len: 0,
            data_off: 0,
            src,
            compat_version: 1,
            reserved: 0,
            crc: 0,
        }
    }

    /// Total bytes of front, middle and data.
    pub fn payload_len(&self) -> u64 {
        self.front_len as u64 + self.middle_len as u64 + self.data_len as u64
    }

    /// Append the header to `buf`, computing and returning its CRC.
    pub fn encode(&self, buf: &mut BytesMut) -> u32 {
        let start = buf.len();
        buf.reserve(HEADER_LEN);
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.tid);
        buf.put_u16_le(self.msg_type);
        buf.put_u16_le(self.priority);
        buf.put_u16_le(self.version);
        buf.put_u32_le(self.front_len);
        buf.put_u32_le(self.middle_len);
        buf.put_u32_le(self.data_len);
        buf.put_u16_le(self.data_off);
        buf.put_u8(self.src.ty.as_u8());
        buf.put_i64_le(self.src.num);
        buf.put_u16_le(self.compat_version);
        buf.put_u16_le(self.reserved);
        let crc = crc32c::crc32c(&buf[start..]);
        buf.put_u32_le(crc);
        crc
    }

    pub fn decode(raw: &[u8], verify_crc: bool) -> Result<Self, WireError> {
        ensure(raw, HEADER_LEN)?;
        let mut b = &raw[..HEADER_LEN];
        let seq = b.get_u64_le();
        let tid = b.get_u64_le();
        let msg_type = b.get_u16_le();
        let priority = b.get_u16_le();
        let version = b.get_u16_le();
        let front_len = b.get_u32_le();
        let middle_len = b.get_u32_le();
        let data_len = b.get_u32_le();
        let data_off = b.get_u16_le();
        let src_ty = b.get_u8();
        let src_num = b.get_i64_le();
        let compat_version = b.get_u16_le();
        let reserved = b.get_u16_le();
        let crc = b.get_u32_le();

        if verify_crc {
            let actual = crc32c::crc32c(&raw[..HEADER_LEN - 4]);
            if actual != crc {
                return Err(WireError::HeaderCrc {
                    expected: crc,
                    actual,
                });
            }
        }

        let ty = EntityType::from_u8(src_ty).ok_or(WireError::UnknownEntityType(src_ty))?;
        Ok(Self {
            seq,
            tid,
            msg_type,
            priority,
            version,
            front_len,
            middle_len,
            data_len,
            data_off,
            src: EntityName::new(ty, src_num),
            compat_version,
            reserved,
            crc,
        })
    }
}

/// Fixed-size message footer carrying payload checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFooter {
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    pub sig: u64,
    pub flags: u8,
}

impl MessageFooter {
    /// Compute checksums for a complete outgoing message.
    pub fn seal(front: &[u8], middle: &[u8], data: &[u8], crc_data: bool) -> Self {
        let mut flags = FOOTER_COMPLETE;
        let data_crc = if crc_data {
            crc32c::crc32c(data)
        } else {
            flags |= FOOTER_NOCRC;
            0
        };
        Self {
            front_crc: crc32c::crc32c(front),
            middle_crc: crc32c::crc32c(middle),
            data_crc,
            sig: 0,
            flags,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FOOTER_LEN);
        buf.put_u32_le(self.front_crc);
        buf.put_u32_le(self.middle_crc);
        buf.put_u32_le(self.data_crc);
        buf.put_u64_le(self.sig);
        buf.put_u8(self.flags);
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        ensure(raw, FOOTER_LEN)?;
        let mut b = &raw[..FOOTER_LEN];
        Ok(Self {
            front_crc: b.get_u32_le(),
            middle_crc: b.get_u32_le(),
            data_crc: b.get_u32_le(),
            sig: b.get_u64_le(),
            flags: b.get_u8(),
        })
    }

    /// Check the received payload against this footer.
    pub fn verify(
        &self,
        front: &[u8],
        middle: &[u8],
        data: &[u8],
        check: bool,
    ) -> Result<(), WireError> {
        if self.flags & FOOTER_COMPLETE == 0 {
            return Err(WireError::Aborted);
        }
        if !check {
            return Ok(());
        }
        let regions: [(&'static str, u32, &[u8]); 2] =
            [("front", self.front_crc, front), ("middle", self.middle_crc, middle)];
        for (region, expected, bytes) in regions {
            let actual = crc32c::crc32c(bytes);
            if actual != expected {
                return Err(WireError::PayloadCrc {
                    region,
                    expected,
                    actual,
                });
            }
        }
        if self.flags & FOOTER_NOCRC == 0 {
            let actual = crc32c::crc32c(data);
            if actual != self.data_crc {
                return Err(WireError::PayloadCrc {
                    region: "data",
                    expected: self.data_crc,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Handshake request sent by the connecting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub features: u64,
    pub host_type: u32,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub flags: u8,
}

impl ConnectRequest {
    pub fn encode(&self) -> [u8; CONNECT_REQUEST_LEN] {
        let mut out = [0u8; CONNECT_REQUEST_LEN];
        let mut b = &mut out[..];
        b.put_u64_le(self.features);
        b.put_u32_le(self.host_type);
        b.put_u32_le(self.global_seq);
        b.put_u32_le(self.connect_seq);
        b.put_u32_le(self.protocol_version);
        b.put_u8(self.flags);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        ensure(raw, CONNECT_REQUEST_LEN)?;
        let mut b = raw;
        Ok(Self {
            features: b.get_u64_le(),
            host_type: b.get_u32_le(),
            global_seq: b.get_u32_le(),
            connect_seq: b.get_u32_le(),
            protocol_version: b.get_u32_le(),
            flags: b.get_u8(),
        })
    }

    pub fn is_server(&self) -> bool {
        self.flags & CONNECT_SERVER != 0
    }
}

/// Handshake reply sent by the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub tag: u8,
    pub features: u64,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub flags: u8,
}

impl ConnectReply {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag: tag as u8,
            features: 0,
            global_seq: 0,
            connect_seq: 0,
            protocol_version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    pub fn encode(&self) -> [u8; CONNECT_REPLY_LEN] {
        let mut out = [0u8; CONNECT_REPLY_LEN];
        let mut b = &mut out[..];
        b.put_u8(self.tag);
        b.put_u64_le(self.features);
        b.put_u32_le(self.global_seq);
        b.put_u32_le(self.connect_seq);
        b.put_u32_le(self.protocol_version);
        b.put_u8(self.flags);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        ensure(raw, CONNECT_REPLY_LEN)?;
        let mut b = raw;
        Ok(Self {
            tag: b.get_u8(),
            features: b.get_u64_le(),
            global_seq: b.get_u32_le(),
            connect_seq: b.get_u32_le(),
            protocol_version: b.get_u32_le(),
            flags: b.get_u8(),
        })
    }

    pub fn tag(&self) -> Option<Tag> {
        Tag::from_u8(self.tag)
    }
}

pub fn encode_addr(addr: &EntityAddr) -> [u8; ADDR_LEN] {
    let mut out = [0u8; ADDR_LEN];
    let mut b = &mut out[..];
    b.put_u32_le(addr.ty);
    b.put_u32_le(addr.nonce);
    let mut ip = [0u8; 16];
    let family = match addr.addr.ip() {
        IpAddr::V4(v4) => {
            ip[..4].copy_from_slice(&v4.octets());
            AF_INET
        }
        IpAddr::V6(v6) => {
            ip.copy_from_slice(&v6.octets());
            AF_INET6
        }
    };
    b.put_u16_le(family);
    b.put_u16_le(addr.port());
    b.put_slice(&ip);
    out
}

pub fn decode_addr(raw: &[u8]) -> Result<EntityAddr, WireError> {
    ensure(raw, ADDR_LEN)?;
    let mut b = raw;
    let ty = b.get_u32_le();
    let nonce = b.get_u32_le();
    let family = b.get_u16_le();
    let port = b.get_u16_le();
    let mut ip = [0u8; 16];
    b.copy_to_slice(&mut ip);
    let ip = match family {
        AF_INET => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
        AF_INET6 => IpAddr::V6(Ipv6Addr::from(ip)),
        other => return Err(WireError::BadAddressFamily(other)),
    };
    Ok(EntityAddr {
        ty,
        nonce,
        addr: SocketAddr::new(ip, port),
    })
}

/// Keepalive timestamp: seconds and nanoseconds since the epoch.
pub fn encode_stamp(t: SystemTime) -> [u8; STAMP_LEN] {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut out = [0u8; STAMP_LEN];
    let mut b = &mut out[..];
    b.put_u32_le(since.as_secs() as u32);
    b.put_u32_le(since.subsec_nanos());
    out
}

pub fn decode_stamp(raw: &[u8]) -> Result<SystemTime, WireError> {
    ensure(raw, STAMP_LEN)?;
    let mut b = raw;
    let secs = b.get_u32_le();
    let nanos = b.get_u32_le();
    Ok(UNIX_EPOCH + Duration::new(secs as u64, nanos.min(999_999_999)))
}

/// A message framed for the wire. Payload regions are shared, not copied.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    /// Tag byte followed by the header.
    pub head: Bytes,
    pub front: Bytes,
    pub middle: Bytes,
    pub data: Bytes,
    pub footer: Bytes,
}

impl EncodedMessage {
    pub fn len(&self) -> usize {
        self.head.len() + self.front.len() + self.middle.len() + self.data.len() + self.footer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame a message. Region lengths in `header` are overwritten from the
/// actual buffers.
pub fn encode_message(
    header: &MessageHeader,
    front: Bytes,
    middle: Bytes,
    data: Bytes,
    crc_data: bool,
) -> EncodedMessage {
    let mut header = *header;
    header.front_len = front.len() as u32;
    header.middle_len = middle.len() as u32;
    header.data_len = data.len() as u32;

    let mut head = BytesMut::with_capacity(1 + HEADER_LEN);
    head.put_u8(Tag::Msg as u8);
    header.encode(&mut head);

    let mut footer = BytesMut::with_capacity(FOOTER_LEN);
    MessageFooter::seal(&front, &middle, &data, crc_data).encode(&mut footer);

    EncodedMessage {
        head: head.freeze(),
        front,
        middle,
        data,
        footer: footer.freeze(),
    }
}

/// A decoded `MSG` frame.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub header: MessageHeader,
    pub front: Bytes,
    pub middle: Bytes,
    pub data: Bytes,
    pub footer: MessageFooter,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode a contiguous `MSG` frame with the same header, footer and
    /// verify steps the socket reader applies to a stream.
    fn read_frame(
        frame: &[u8],
        crc_header: bool,
        crc_data: bool,
    ) -> Result<DecodedMessage, WireError> {
        assert_eq!(frame[0], Tag::Msg as u8);
        let mut rest = Bytes::copy_from_slice(&frame[1..]);
        let header = MessageHeader::decode(&rest, crc_header)?;
        rest.advance(HEADER_LEN);
        let front = rest.split_to(header.front_len as usize);
        let middle = rest.split_to(header.middle_len as usize);
        let data = rest.split_to(header.data_len as usize);
        let footer = MessageFooter::decode(&rest)?;
        footer.verify(&front, &middle, &data, crc_data)?;
        Ok(DecodedMessage {
            header,
            front,
            middle,
            data,
            footer,
        })
    }

    fn contiguous(e: &EncodedMessage) -> BytesMut {
        let mut out = BytesMut::with_capacity(e.len());
        for chunk in [&e.head, &e.front, &e.middle, &e.data, &e.footer] {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn sample_header() -> MessageHeader {
        let mut h = MessageHeader::new(42, EntityName::osd(7));
        h.seq = 9;
        h.tid = 1234;
        h.priority = 196;
        h.data_off = 16;
        h
    }

    #[test]
    fn fixed_sizes_match_layout() {
        let mut buf = BytesMut::new();
        sample_header().encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let mut buf = BytesMut::new();
        MessageFooter::default().encode(&mut buf);
        assert_eq!(buf.len(), FOOTER_LEN);

        let req = ConnectRequest {
            features: features::SUPPORTED,
            host_type: EntityType::Client as u32,
            global_seq: 3,
            connect_seq: 1,
            protocol_version: PROTOCOL_VERSION,
            flags: CONNECT_LOSSY,
        };
        assert_eq!(ConnectRequest::decode(&req.encode()).unwrap(), req);
        assert_eq!(ConnectReply::new(Tag::Ready).encode().len(), CONNECT_REPLY_LEN);
    }

    #[test]
    fn message_frame_round_trip() {
        let header = sample_header();
        let front = Bytes::from_static(b"front bytes");
        let middle = Bytes::new();
        let data = Bytes::from(vec![0xabu8; 4096]);

        let encoded = encode_message(&header, front.clone(), middle.clone(), data.clone(), true);
        let decoded = read_frame(&contiguous(&encoded), true, true).unwrap();

        assert_eq!(decoded.header.seq, header.seq);
        assert_eq!(decoded.header.tid, header.tid);
        assert_eq!(decoded.header.msg_type, header.msg_type);
        assert_eq!(decoded.header.priority, header.priority);
        assert_eq!(decoded.header.src, header.src);
        assert_eq!(decoded.header.data_len, 4096);
        assert_eq!(decoded.front, front);
        assert_eq!(decoded.middle, middle);
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn corrupted_regions_are_rejected() {
        let encoded = encode_message(
            &sample_header(),
            Bytes::from_static(b"front"),
            Bytes::from_static(b"middle"),
            Bytes::from_static(b"data region"),
            true,
        );
        let clean = contiguous(&encoded);
        let front_at = 1 + HEADER_LEN;
        let middle_at = front_at + 5;
        let data_at = middle_at + 6;

        // header byte, then one byte in each payload region
        let cases = [
            (3usize, true),
            (front_at, false),
            (middle_at, false),
            (data_at + 2, false),
        ];
        for (offset, expect_header) in cases {
            let mut bad = clean.clone();
            bad[offset] ^= 0xff;
            let err = read_frame(&bad, true, true).unwrap_err();
            match err {
                WireError::HeaderCrc { .. } => assert!(expect_header),
                WireError::PayloadCrc { .. } => assert!(!expect_header),
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn corruption_ignored_when_checks_disabled() {
        let encoded = encode_message(
            &sample_header(),
            Bytes::from_static(b"front"),
            Bytes::new(),
            Bytes::from_static(b"data"),
            false,
        );
        let mut bad = contiguous(&encoded);
        let last_data = bad.len() - FOOTER_LEN - 1;
        bad[last_data] ^= 0x01;
        // data region was sent without a crc, so only front/middle are checked
        assert!(read_frame(&bad, true, true).is_ok());
    }

    #[test]
    fn receiver_can_skip_checks() {
        let encoded = encode_message(
            &sample_header(),
            Bytes::from_static(b"front"),
            Bytes::new(),
            Bytes::from_static(b"data"),
            true,
        );
        let mut bad = contiguous(&encoded);
        bad[5] ^= 0x01;
        let last_data = bad.len() - FOOTER_LEN - 1;
        bad[last_data] ^= 0x01;
        assert!(read_frame(&bad, true, true).is_err());
        let decoded = read_frame(&bad, false, false).unwrap();
        assert_eq!(decoded.data.as_ref(), b"dat`");
    }

    #[test]
    fn incomplete_footer_is_aborted() {
        let mut buf = BytesMut::new();
        MessageFooter::default().encode(&mut buf);
        let footer = MessageFooter::decode(&buf).unwrap();
        assert!(matches!(
            footer.verify(b"", b"", b"", true),
            Err(WireError::Aborted)
        ));
    }

    #[test]
    fn addr_encoding() {
        let v4: EntityAddr = "192.168.1.20:6800/99".parse().unwrap();
        let v6: EntityAddr = "[fe80::1]:6801/3".parse().unwrap();
        for addr in [v4, v6, EntityAddr::blank(5)] {
            assert_eq!(decode_addr(&encode_addr(&addr)).unwrap(), addr);
        }

        let mut raw = encode_addr(&v4);
        raw[8] = 99;
        assert!(matches!(decode_addr(&raw), Err(WireError::BadAddressFamily(99))));
    }

    #[test]
    fn truncated_input_is_reported() {
        let err = MessageHeader::decode(&[0u8; 10], true).unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: HEADER_LEN, have: 10 }));
    }
}
