//! BinaryCodec: header + five length-prefixed sections + Reed–Solomon parity.
//!
//! Header layout (big-endian):
//!
//! ```text
//! version:u8  message_type:u8  timestamp_ms:u64
//! source_id_len:u16  source_id:utf8
//! target_tier:u8  priority:u8  sequence:u32  total_length:u32
//! ```
//!
//! `total_length` counts every payload byte after the header, parity
//! included. The low nibble of `message_type` is the type, the high nibble
//! carries flags.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::FRAME_VERSION;
use crate::ecc::{EccConfig, ReedSolomon};
use crate::error::{CodecError, DegradedFrame};
use crate::tier::Tier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Data,
    Command,
    Report,
    Clarification,
}

impl MessageType {
    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Data => 1,
            MessageType::Command => 2,
            MessageType::Report => 3,
            MessageType::Clarification => 4,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Data),
            2 => Some(MessageType::Command),
            3 => Some(MessageType::Report),
            4 => Some(MessageType::Clarification),
            _ => None,
        }
    }
}

/// High-nibble flags of the `message_type` byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFlags {
    pub escalate: bool,
    pub bypass: bool,
}

impl FrameFlags {
    pub const ESCALATE: u8 = 0x80;
    pub const BYPASS: u8 = 0x40;
    const RESERVED: u8 = 0x30;

    pub fn bits(self) -> u8 {
        (if self.escalate { Self::ESCALATE } else { 0 }) | (if self.bypass { Self::BYPASS } else { 0 })
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            escalate: bits & Self::ESCALATE != 0,
            bypass: bits & Self::BYPASS != 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub flags: FrameFlags,
    pub timestamp_ms: u64,
    pub source_id: String,
    pub target_tier: Tier,
    pub priority: u8,
    pub sequence: u32,
    pub total_length: u32,
}

impl FrameHeader {
    fn put(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits() | self.message_type.to_wire());
        buf.put_u64(self.timestamp_ms);
        buf.put_u16(count(self.source_id.len(), "source_id")?);
        buf.put_slice(self.source_id.as_bytes());
        buf.put_u8(self.target_tier.to_wire());
        buf.put_u8(self.priority);
        buf.put_u32(self.sequence);
        buf.put_u32(self.total_length);
        Ok(())
    }

    fn parse(buf: &mut impl Buf) -> Result<Self, CodecError> {
        need(&*buf, 2, "header")?;
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let type_byte = buf.get_u8();
        if type_byte & FrameFlags::RESERVED != 0 {
            return Err(CodecError::InvalidField {
                field: "message_type flags",
                value: u64::from(type_byte),
            });
        }
        let message_type =
            MessageType::from_wire(type_byte & 0x0f).ok_or(CodecError::InvalidField {
                field: "message_type",
                value: u64::from(type_byte),
            })?;
        let flags = FrameFlags::from_bits(type_byte);

        need(&*buf, 10, "header")?;
        let timestamp_ms = buf.get_u64();
        let id_len = buf.get_u16() as usize;
        need(&*buf, id_len, "source_id")?;
        let mut raw = vec![0u8; id_len];
        buf.copy_to_slice(&mut raw);
        let source_id = String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8("source_id"))?;

        need(&*buf, 10, "header")?;
        let tier_byte = buf.get_u8();
        let target_tier = Tier::from_wire(tier_byte).ok_or(CodecError::InvalidField {
            field: "target_tier",
            value: u64::from(tier_byte),
        })?;
        let priority = buf.get_u8();
        if !(1..=10).contains(&priority) {
            return Err(CodecError::InvalidField {
                field: "priority",
                value: u64::from(priority),
            });
        }
        let sequence = buf.get_u32();
        let total_length = buf.get_u32();
        Ok(Self {
            version,
            message_type,
            flags,
            timestamp_ms,
            source_id,
            target_tier,
            priority,
            sequence,
            total_length,
        })
    }
}

/// Fail with `Truncated` unless `buf` holds `n` more bytes.
pub(crate) fn need(buf: &impl Buf, n: usize, context: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated {
            context,
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

/// Narrow a length or count to its wire width.
pub(crate) fn count<T: TryFrom<usize>>(n: usize, field: &'static str) -> Result<T, CodecError> {
    T::try_from(n).map_err(|_| CodecError::TooLong { field, len: n })
}

/// The five payload sections, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadSections {
    pub affect: Bytes,
    pub tree: Bytes,
    pub symbolic: Bytes,
    pub equation: Bytes,
    pub series: Bytes,
}

impl PayloadSections {
    fn ordered(&self) -> [&Bytes; 5] {
        [
            &self.affect,
            &self.tree,
            &self.symbolic,
            &self.equation,
            &self.series,
        ]
    }

    fn encoded_len(&self) -> usize {
        self.ordered().iter().map(|s| 4 + s.len()).sum()
    }

    fn put(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        for section in self.ordered() {
            buf.put_u32(count(section.len(), "payload section")?);
            buf.put_slice(section);
        }
        Ok(())
    }

    /// Split recovered payload bytes into the five sections.
    pub fn from_bytes(mut data: Bytes) -> Result<Self, CodecError> {
        const NAMES: [&str; 5] = ["affect", "tree", "symbolic", "equation", "series"];
        let mut sections: [Bytes; 5] = Default::default();
        for (slot, name) in sections.iter_mut().zip(NAMES) {
            need(&data, 4, name)?;
            let len = data.get_u32() as usize;
            need(&data, len, name)?;
            *slot = data.split_to(len);
        }
        if data.has_remaining() {
            return Err(CodecError::InvalidField {
                field: "trailing payload bytes",
                value: data.remaining() as u64,
            });
        }
        let [affect, tree, symbolic, equation, series] = sections;
        Ok(Self {
            affect,
            tree,
            symbolic,
            equation,
            series,
        })
    }
}

/// An assembled frame. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryFrame {
    header: FrameHeader,
    sections: PayloadSections,
    bytes: Bytes,
}

impl BinaryFrame {
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn sections(&self) -> &PayloadSections {
        &self.sections
    }

    /// Full wire bytes: header, sections, parity.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A parsed frame and how many symbols ECC had to repair.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub frame: BinaryFrame,
    pub corrected: usize,
}

/// Frames sections with Reed–Solomon protection.
///
/// Parity covers the concatenated payload only. The header carries no
/// parity, so a damaged header byte makes `decode` fail instead of being
/// repaired.
#[derive(Clone, Debug)]
pub struct BinaryCodec {
    rs: ReedSolomon,
}

impl BinaryCodec {
    pub fn new(ecc: &EccConfig) -> Result<Self, CodecError> {
        Ok(Self {
            rs: ReedSolomon::new(ecc)?,
        })
    }

    /// Build a frame. `header.total_length` is overwritten with the real
    /// payload size; `header.version` with the current version. Fails with
    /// `TooLong` when a length does not fit its prefix.
    pub fn encode(&self, mut header: FrameHeader, sections: PayloadSections) -> Result<BinaryFrame, CodecError> {
        let mut data = BytesMut::with_capacity(sections.encoded_len());
        sections.put(&mut data)?;
        let payload = self.rs.protect(&data);

        header.version = FRAME_VERSION;
        header.total_length = count(payload.len(), "payload")?;

        let mut out = BytesMut::with_capacity(24 + header.source_id.len() + payload.len());
        header.put(&mut out)?;
        out.put_slice(&payload);
        Ok(BinaryFrame {
            header,
            sections,
            bytes: out.freeze(),
        })
    }

    /// Parse just the header.
    pub fn peek_header(bytes: &[u8]) -> Result<FrameHeader, CodecError> {
        let mut buf = bytes;
        FrameHeader::parse(&mut buf)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
        let mut buf = bytes;
        let header = FrameHeader::parse(&mut buf)?;
        let header_len = bytes.len() - buf.len();
        if buf.len() != header.total_length as usize {
            return Err(CodecError::LengthMismatch {
                declared: header.total_length as usize,
                actual: buf.len(),
            });
        }

        let recovered = self.rs.recover(buf).map_err(|failure| CodecError::EccUncorrectable {
            block: failure.block,
            degraded: Box::new(DegradedFrame {
                header: header.clone(),
                payload: failure.data,
                degraded: true,
            }),
        })?;

        // Re-protect so the held bytes are the corrected frame.
        let payload = self.rs.protect(&recovered.data);
        let sections = PayloadSections::from_bytes(Bytes::from(recovered.data))?;
        let mut wire = BytesMut::with_capacity(header_len + payload.len());
        wire.put_slice(&bytes[..header_len]);
        wire.put_slice(&payload);
        Ok(DecodedFrame {
            frame: BinaryFrame {
                header,
                sections,
                bytes: wire.freeze(),
            },
            corrected: recovered.corrected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrameHeader {
        FrameHeader {
            version: FRAME_VERSION,
            message_type: MessageType::Data,
            flags: FrameFlags::default(),
            timestamp_ms: 1_700_000_000_000,
            source_id: "prime-01".into(),
            target_tier: Tier::Prime,
            priority: 5,
            sequence: 7,
            total_length: 0,
        }
    }

    fn sections() -> PayloadSections {
        PayloadSections {
            affect: Bytes::from_static(b"affect"),
            tree: Bytes::from_static(b"tree-bytes"),
            symbolic: Bytes::from_static(b"sym"),
            equation: Bytes::new(),
            series: Bytes::from(vec![9u8; 400]),
        }
    }

    fn codec() -> BinaryCodec {
        BinaryCodec::new(&EccConfig::default()).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let frame = codec().encode(header(), sections()).unwrap();
        let b = frame.as_bytes();
        assert_eq!(b[0], 1);
        assert_eq!(b[1], 0x01);
        assert_eq!(&b[2..10], &1_700_000_000_000u64.to_be_bytes());
        assert_eq!(&b[10..12], &8u16.to_be_bytes());
        assert_eq!(&b[12..20], b"prime-01");
        assert_eq!(b[20], 1, "target tier");
        assert_eq!(b[21], 5, "priority");
        assert_eq!(&b[22..26], &7u32.to_be_bytes());
        let total = u32::from_be_bytes([b[26], b[27], b[28], b[29]]) as usize;
        assert_eq!(total, b.len() - 30);
        assert_eq!(total, frame.header().total_length as usize);
    }

    #[test]
    fn test_total_length_includes_parity() {
        let frame = codec().encode(header(), sections()).unwrap();
        let data = 4 * 5 + 6 + 10 + 3 + 400;
        // 439 data bytes → two blocks → 64 parity bytes
        assert_eq!(frame.header().total_length as usize, data + 64);
    }

    #[test]
    fn test_flags_share_the_type_byte() {
        let mut h = header();
        h.message_type = MessageType::Command;
        h.flags = FrameFlags { escalate: true, bypass: true };
        let frame = codec().encode(h, sections()).unwrap();
        assert_eq!(frame.as_bytes()[1], 0xC2);
        let parsed = BinaryCodec::peek_header(frame.as_bytes()).unwrap();
        assert!(parsed.flags.escalate && parsed.flags.bypass);
        assert_eq!(parsed.message_type, MessageType::Command);
    }

    #[test]
    fn test_oversized_source_id_refused() {
        let mut h = header();
        h.source_id = "p".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            codec().encode(h, sections()),
            Err(CodecError::TooLong { field: "source_id", len: 65_536 })
        ));
    }

    #[test]
    fn test_decode_roundtrip_and_repair() {
        let codec = codec();
        let frame = codec.encode(header(), sections()).unwrap();
        let mut bytes = frame.as_bytes().to_vec();
        bytes[40] ^= 0xff;
        bytes[41] ^= 0x0f;
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.corrected, 2);
        assert_eq!(decoded.frame, frame);
    }

    #[test]
    fn test_uncorrectable_returns_degraded_payload() {
        let codec = codec();
        let frame = codec.encode(header(), sections()).unwrap();
        let mut bytes = frame.as_bytes().to_vec();
        for i in 0..20 {
            bytes[30 + i * 3] ^= 0x33;
        }
        match codec.decode(&bytes) {
            Err(CodecError::EccUncorrectable { block, degraded }) => {
                assert_eq!(block, 0);
                assert!(degraded.degraded);
                assert_eq!(degraded.header.source_id, "prime-01");
                assert_eq!(degraded.payload[0], bytes[30]);
            }
            other => panic!("expected EccUncorrectable, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_headers() {
        let codec = codec();
        let good = codec.encode(header(), sections()).unwrap().as_bytes().to_vec();

        let mut bad = good.clone();
        bad[0] = 9;
        assert!(matches!(codec.decode(&bad), Err(CodecError::UnsupportedVersion(9))));

        let mut bad = good.clone();
        bad[20] = 4;
        assert!(matches!(
            codec.decode(&bad),
            Err(CodecError::InvalidField { field: "target_tier", .. })
        ));

        let mut bad = good.clone();
        bad[21] = 0;
        assert!(codec.decode(&bad).is_err());

        assert!(matches!(
            codec.decode(&good[..good.len() - 1]),
            Err(CodecError::LengthMismatch { .. })
        ));
        assert!(matches!(
            codec.decode(&good[..5]),
            Err(CodecError::Truncated { .. })
        ));
    }
}
