// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy TCP framing codec for the tessera transport
//!
//! Wire format (23 bytes overhead):
//! ```text
//! [u16 BE: schema_version][u8: frame_type][u32 BE: source][u32 BE: tag][u64 BE: seq]
//! [u32 BE: payload_len][payload bytes]
//! ```
//!
//! `Message` frames carry a payload; `Ack`/`Nack` frames answer a message by echoing its
//! `seq` with an empty payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use tessera_common::NodeId;

/// Current schema version
const SCHEMA_VERSION_V1: u16 = 1;

/// Maximum payload size (64 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame header size (version + type + source + tag + seq + length)
pub const FRAME_HEADER_SIZE: usize = 2 + 1 + 4 + 4 + 8 + 4; // 23 bytes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A payload addressed to a tag on the receiving node.
    Message = 0,
    /// The message with this `seq` was consumed by a receive.
    Ack = 1,
    /// The message with this `seq` was discarded without being consumed.
    Nack = 2,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Message),
            1 => Some(FrameType::Ack),
            2 => Some(FrameType::Nack),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One decoded frame. `payload` is a zero-copy slice of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub source: NodeId,
    pub tag: u32,
    pub seq: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn message(source: NodeId, tag: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Message,
            source,
            tag,
            seq,
            payload,
        }
    }

    /// Whether the payload fits under [`MAX_PAYLOAD_SIZE`].
    pub fn is_encodable(&self) -> bool {
        self.payload.len() <= MAX_PAYLOAD_SIZE as usize
    }

    /// Answer to message `seq`: `Ack` when it was consumed, `Nack` otherwise.
    pub fn reply(source: NodeId, seq: u64, consumed: bool) -> Self {
        Self {
            frame_type: if consumed {
                FrameType::Ack
            } else {
                FrameType::Nack
            },
            source,
            tag: 0,
            seq,
            payload: Bytes::new(),
        }
    }
}

/// Frame codec for the TCP transport
///
/// The decoder keeps state across calls to support partial frame reception.
#[derive(Debug, Clone)]
pub struct TcpFrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the fixed-size frame header
    AwaitingHeader,
    /// Waiting for the payload, with known length
    AwaitingPayload {
        frame_type: FrameType,
        source: NodeId,
        tag: u32,
        seq: u64,
        payload_len: u32,
    },
}

impl TcpFrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
        }
    }

    /// Validate that the payload length is reasonable
    fn validate_length(payload_len: u32) -> io::Result<()> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame size {} exceeds maximum {}",
                    payload_len, MAX_PAYLOAD_SIZE
                ),
            ));
        }
        Ok(())
    }
}

impl Default for TcpFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TcpFrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if src.len() < FRAME_HEADER_SIZE {
                        return Ok(None);
                    }

                    let schema_version = src.get_u16();
                    if schema_version != SCHEMA_VERSION_V1 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "Unsupported schema version: {} (expected {})",
                                schema_version, SCHEMA_VERSION_V1
                            ),
                        ));
                    }

                    let frame_type_byte = src.get_u8();
                    let frame_type = FrameType::from_u8(frame_type_byte).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Invalid frame type: {}", frame_type_byte),
                        )
                    })?;

                    let source = NodeId::new(src.get_u32());
                    let tag = src.get_u32();
                    let seq = src.get_u64();
                    let payload_len = src.get_u32();

                    // Validate before waiting for (or reserving) the payload
                    Self::validate_length(payload_len)?;
                    src.reserve(payload_len as usize);

                    self.state = DecodeState::AwaitingPayload {
                        frame_type,
                        source,
                        tag,
                        seq,
                        payload_len,
                    };
                }

                DecodeState::AwaitingPayload {
                    frame_type,
                    source,
                    tag,
                    seq,
                    payload_len,
                } => {
                    if src.len() < payload_len as usize {
                        return Ok(None);
                    }

                    // Zero-copy: the payload shares the receive buffer
                    let payload = src.split_to(payload_len as usize).freeze();

                    self.state = DecodeState::AwaitingHeader;

                    return Ok(Some(Frame {
                        frame_type,
                        source,
                        tag,
                        seq,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for TcpFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = u32::try_from(frame.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Frame size overflow"))?;
        Self::validate_length(payload_len)?;

        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        dst.put_u16(SCHEMA_VERSION_V1);
        dst.put_u8(frame.frame_type.as_u8());
        dst.put_u32(frame.source.as_u32());
        dst.put_u32(frame.tag);
        dst.put_u64(frame.seq);
        dst.put_u32(payload_len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_bytes(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        TcpFrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    /// Builds a raw header with arbitrary fields for negative testing.
    fn create_unsafe_header(schema_version: u16, frame_type: u8, payload_len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(schema_version);
        buf.put_u8(frame_type);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u64(0);
        buf.put_u32(payload_len);
        buf
    }

    #[test]
    fn test_decode_message_frame() {
        let frame = Frame::message(NodeId::new(3), 1025, 42, Bytes::from_static(b"payload"));
        let mut buf = encode_to_bytes(frame.clone());
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 7);

        let decoded = TcpFrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_reply_frames() {
        for consumed in [true, false] {
            let mut buf = encode_to_bytes(Frame::reply(NodeId::new(1), 7, consumed));
            let decoded = TcpFrameCodec::new().decode(&mut buf).unwrap().unwrap();
            let expected = if consumed {
                FrameType::Ack
            } else {
                FrameType::Nack
            };
            assert_eq!(decoded.frame_type, expected);
            assert_eq!(decoded.seq, 7);
            assert_eq!(decoded.payload.len(), 0);
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = TcpFrameCodec::new();
        let full = encode_to_bytes(Frame::message(
            NodeId::new(0),
            1,
            1,
            Bytes::from_static(b"test-payload"),
        ));

        // partial header
        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // header complete, payload missing
        buf.extend_from_slice(&full[5..FRAME_HEADER_SIZE]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[FRAME_HEADER_SIZE..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"test-payload");
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = TcpFrameCodec::new();
        let mut buf = encode_to_bytes(Frame::message(
            NodeId::new(0),
            1,
            1,
            Bytes::from_static(b"first"),
        ));
        buf.extend_from_slice(&encode_to_bytes(Frame::message(
            NodeId::new(0),
            1,
            2,
            Bytes::from_static(b"second"),
        )));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.seq, &first.payload[..]), (1, &b"first"[..]));
        assert_eq!((second.seq, &second.payload[..]), (2, &b"second"[..]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_schema_version() {
        let mut buf = create_unsafe_header(999, 0, 0);
        let err = TcpFrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("Unsupported schema version"));
    }

    #[test]
    fn test_decode_invalid_frame_type() {
        let mut buf = create_unsafe_header(SCHEMA_VERSION_V1, 255, 0);
        let err = TcpFrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("Invalid frame type"));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut buf = create_unsafe_header(SCHEMA_VERSION_V1, 0, MAX_PAYLOAD_SIZE + 1);
        let err = TcpFrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_encodable_limit() {
        let at_limit = Frame::message(
            NodeId::new(0),
            1,
            1,
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize]),
        );
        assert!(at_limit.is_encodable());
        assert!(Frame::reply(NodeId::new(0), 1, true).is_encodable());

        let over = Frame::message(
            NodeId::new(0),
            1,
            2,
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize + 1]),
        );
        assert!(!over.is_encodable());
        let mut buf = BytesMut::new();
        assert!(TcpFrameCodec::new().encode(over, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
