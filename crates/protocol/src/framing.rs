//! Length-prefixed frame codec with optional LZ4 compression.
//!
//! The agent persists session recordings as a flat sequence of frames, one
//! per recorded chunk.
//!
//! # Frame Format
//!
//! - 4 bytes: magic bytes "DTRM"
//! - 4 bytes: content length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (possibly LZ4 compressed)

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a DevTerm frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DTRM";

/// Payloads larger than this are compressed when compression is enabled.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Magic and length prefix, before the flags byte.
const PREFIX_SIZE: usize = 8;

/// Flags carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A decoded frame. The payload is always held uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec that compresses large payloads.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = (self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD)
            .then(|| lz4_flex::compress_prepend_size(payload))
            // only keep compression when it actually helps
            .filter(|c| c.len() < payload.len());

        let (body, flags) = match &compressed {
            Some(c) => (c.as_slice(), frame.flags.with_compressed(true)),
            None => (payload.as_slice(), frame.flags.with_compressed(false)),
        };

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);
        Ok(output)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Framing(format!(
                "incomplete frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Decode one frame, returning `None` if `data` holds only part of it.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some(content_len) = read_prefix(data)? else {
            return Ok(None);
        };
        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "frame content must contain a flags byte".to_string(),
            ));
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];
        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body)
                .map_err(|e| ProtocolError::Decompression(e.to_string()))?
        } else {
            body.to_vec()
        };

        Ok(Some((
            Frame {
                flags: flags.with_compressed(false),
                payload,
            },
            total,
        )))
    }

    /// Iterate over every frame in `data`.
    pub fn frames<'a>(&'a self, data: &'a [u8]) -> FrameReader<'a> {
        FrameReader {
            codec: self,
            data,
            offset: 0,
        }
    }
}

/// Validate magic and size, returning the content length once the header
/// is fully available.
fn read_prefix(data: &[u8]) -> Result<Option<usize>> {
    if data.len() >= 4 && data[..4] != FRAME_MAGIC {
        return Err(ProtocolError::InvalidFrameMagic {
            expected: u32::from_be_bytes(FRAME_MAGIC),
            got: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        });
    }
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Some(content_len))
}

/// Iterator over consecutive frames in a buffer.
///
/// A trailing partial frame is reported as a [`ProtocolError::Framing`]
/// error, after which iteration stops.
#[derive(Debug)]
pub struct FrameReader<'a> {
    codec: &'a FrameCodec,
    data: &'a [u8],
    offset: usize,
}

impl Iterator for FrameReader<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return None;
        }
        match self.codec.decode(rest) {
            Ok((frame, consumed)) => {
                self.offset += consumed;
                Some(Ok(frame))
            }
            Err(e) => {
                self.offset = self.data.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new();
        assert!(!flags.is_compressed());
        assert!(flags.with_compressed(true).is_compressed());
        assert_eq!(flags.with_compressed(true).as_byte(), 0b0000_0001);
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_frame_header_format() {
        let codec = FrameCodec::new();
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = codec.encode(&Frame::new(payload.clone())).unwrap();

        assert_eq!(&encoded[0..4], b"DTRM");
        let length = u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(length, 5);
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], &payload[..]);
    }

    #[test]
    fn test_empty_payload() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![])).unwrap();
        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload: Vec<u8> = (0..4096).map(|i| (i % 64) as u8).collect();
        let encoded = codec.encode(&Frame::new(payload.clone())).unwrap();

        assert_eq!(encoded[8] & 0x01, 0x01, "compression flag should be set");
        assert!(encoded.len() < payload.len());

        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert!(!decoded.flags.is_compressed());
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_compression_threshold() {
        let codec = FrameCodec::new();

        let encoded = codec.encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD])).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x00, "payload at threshold stays raw");

        let encoded = codec.encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD + 1])).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x01, "payload above threshold is compressed");
    }

    #[test]
    fn test_without_compression() {
        let codec = FrameCodec::without_compression();
        let encoded = codec.encode(&Frame::new(vec![7u8; 4096])).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x00);
    }

    #[test]
    fn test_invalid_magic() {
        let codec = FrameCodec::new();
        let mut bad = b"BAD!".to_vec();
        bad.extend_from_slice(&5u32.to_be_bytes());
        bad.push(0);
        bad.extend_from_slice(&[1, 2, 3, 4]);

        assert!(matches!(
            codec.decode(&bad),
            Err(ProtocolError::InvalidFrameMagic { .. })
        ));
        assert!(codec.try_decode(&bad).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::without_compression();
        let err = codec.encode(&Frame::new(vec![0u8; MAX_FRAME_SIZE])).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));

        let mut header = FRAME_MAGIC.to_vec();
        header.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        header.push(0);
        assert!(matches!(
            codec.decode(&header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_frame() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![1, 2, 3, 4, 5])).unwrap();

        for i in 0..encoded.len() {
            assert!(codec.try_decode(&encoded[..i]).unwrap().is_none(), "len={i}");
        }
        assert!(matches!(
            codec.decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn test_corrupted_compressed_payload() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&10u32.to_be_bytes());
        bad.push(FrameFlags::COMPRESSED);
        bad.extend_from_slice(&[0xFF; 9]);

        assert!(matches!(
            codec.decode(&bad),
            Err(ProtocolError::Decompression(_))
        ));
    }

    #[test]
    fn test_frame_reader_iterates_in_order() {
        let codec = FrameCodec::new();
        let mut buf = Vec::new();
        for payload in [b"first".to_vec(), vec![9u8; 3000], b"third".to_vec()] {
            buf.extend(codec.encode(&Frame::new(payload)).unwrap());
        }

        let payloads: Vec<Vec<u8>> = codec
            .frames(&buf)
            .map(|f| f.unwrap().payload)
            .collect();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0], b"first");
        assert_eq!(payloads[1], vec![9u8; 3000]);
        assert_eq!(payloads[2], b"third");
    }

    #[test]
    fn test_frame_reader_reports_torn_tail() {
        let codec = FrameCodec::new();
        let mut buf = codec.encode(&Frame::new(b"complete".to_vec())).unwrap();
        let second = codec.encode(&Frame::new(b"torn".to_vec())).unwrap();
        buf.extend_from_slice(&second[..second.len() - 2]);

        let mut reader = codec.frames(&buf);
        assert_eq!(reader.next().unwrap().unwrap().payload, b"complete");
        assert!(matches!(reader.next(), Some(Err(ProtocolError::Framing(_)))));
        assert!(reader.next().is_none());
    }
}
