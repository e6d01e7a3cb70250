// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary framing with a fixed 12 byte big-endian header:
//!
//! ```text
//! offset 0  : version        (1 byte)
//! offset 1  : message type   (1 byte)
//! offset 2  : payload length (2 bytes, unsigned)
//! offset 4  : target id      (8 bytes, unsigned)
//! offset 12 : payload        (payload length bytes)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::network::buffer::ReceiveBuffer;
use crate::AppError::{Incomplete, MalformedProtocol, PacketTooLarge};
use crate::{AppResult, LengthPrefixedConfig};

use super::{CodecParams, FrameCodec, FrameDecoder};

pub const HEADER_LEN: usize = 12;
pub const FRAME_VERSION: u8 = 1;
const PAYLOAD_LEN_POS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: u8,
    pub payload_length: u16,
    pub target_id: u64,
}

impl FrameHeader {
    /// Header of the current version for a payload of `payload_len` bytes.
    pub fn for_payload(message_type: u8, target_id: u64, payload_len: usize) -> AppResult<Self> {
        let payload_length = u16::try_from(payload_len).map_err(|_| {
            PacketTooLarge(format!(
                "payload of {} bytes exceeds the {} bytes a frame can carry",
                payload_len,
                u16::MAX
            ))
        })?;
        Ok(FrameHeader {
            version: FRAME_VERSION,
            message_type,
            payload_length,
            target_id,
        })
    }

    /// Total wire size of the frame this header starts.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_length as usize
    }

    /// Returns the length of the frame at the start of `buffer`, or
    /// `Incomplete` when `buffer` does not hold all of it yet.
    pub fn check(buffer: &[u8]) -> AppResult<usize> {
        if buffer.len() < HEADER_LEN {
            return Err(Incomplete);
        }
        let payload_length =
            u16::from_be_bytes([buffer[PAYLOAD_LEN_POS], buffer[PAYLOAD_LEN_POS + 1]]) as usize;
        let frame_len = HEADER_LEN + payload_length;
        if buffer.len() < frame_len {
            return Err(Incomplete);
        }
        Ok(frame_len)
    }

    pub fn read_from(buffer: &[u8]) -> AppResult<FrameHeader> {
        if buffer.len() < HEADER_LEN {
            return Err(MalformedProtocol(format!(
                "frame header needs {} bytes, got {}",
                HEADER_LEN,
                buffer.len()
            )));
        }
        let mut header = &buffer[..HEADER_LEN];
        Ok(FrameHeader {
            version: header.get_u8(),
            message_type: header.get_u8(),
            payload_length: header.get_u16(),
            target_id: header.get_u64(),
        })
    }

    pub fn write_to(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.version);
        buffer.put_u8(self.message_type);
        buffer.put_u16(self.payload_length);
        buffer.put_u64(self.target_id);
    }
}

/// One decoded length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, target_id: u64, payload: impl Into<Bytes>) -> AppResult<Frame> {
        let payload = payload.into();
        let header = FrameHeader::for_payload(message_type, target_id, payload.len())?;
        Ok(Frame { header, payload })
    }

    pub fn encode(&self) -> Bytes {
        encode_parts(&self.header, &self.payload)
    }

    /// Rebuilds a frame from exactly one complete frame, header included, as
    /// delivered to a connection's data handler.
    pub fn decode(src: &[u8]) -> AppResult<Frame> {
        let header = FrameHeader::read_from(src)?;
        if src.len() != header.frame_len() {
            return Err(MalformedProtocol(format!(
                "frame declares {} payload bytes but carries {}",
                header.payload_length,
                src.len() - HEADER_LEN
            )));
        }
        Ok(Frame {
            header,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..]),
        })
    }

    /// Length of the complete frame at the start of `buffer`, `None` when more
    /// bytes are needed.
    pub(crate) fn split(buffer: &[u8]) -> AppResult<Option<usize>> {
        match FrameHeader::check(buffer) {
            Ok(frame_len) => Ok(Some(frame_len)),
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn encode_parts(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.write_to(&mut buffer);
    buffer.put_slice(payload);
    buffer.freeze()
}

#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    config: LengthPrefixedConfig,
}

impl LengthPrefixedCodec {
    pub fn new(config: LengthPrefixedConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(LengthPrefixedCodec { config })
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        LengthPrefixedCodec {
            config: LengthPrefixedConfig::default(),
        }
    }
}

impl FrameCodec for LengthPrefixedCodec {
    fn name(&self) -> &'static str {
        "length_prefixed"
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(LengthPrefixedDecoder::new(&self.config))
    }

    fn encode(&self, payload: &[u8], params: &CodecParams) -> AppResult<Bytes> {
        let header = FrameHeader::for_payload(params.message_type, params.target_id, payload.len())?;
        Ok(encode_parts(&header, payload))
    }
}

#[derive(Debug)]
pub struct LengthPrefixedDecoder {
    buffer: ReceiveBuffer,
    min_free: usize,
    max_pending: usize,
}

impl LengthPrefixedDecoder {
    pub fn new(config: &LengthPrefixedConfig) -> Self {
        LengthPrefixedDecoder {
            buffer: ReceiveBuffer::with_capacity(config.recv_buffer_capacity),
            min_free: config.min_free_space,
            max_pending: config.max_pending,
        }
    }
}

impl FrameDecoder for LengthPrefixedDecoder {
    fn read_buf(&mut self) -> AppResult<&mut [u8]> {
        if self.buffer.free() < self.min_free {
            trace!(
                pending = self.buffer.pending(),
                free = self.buffer.free(),
                "compact receive buffer"
            );
            self.buffer.compact();
        }
        if self.buffer.pending() > self.max_pending {
            return Err(PacketTooLarge(format!(
                "{} bytes pending without a complete frame, limit is {}",
                self.buffer.pending(),
                self.max_pending
            )));
        }
        Ok(self.buffer.unfilled_mut())
    }

    fn advance(&mut self, n: usize, on_frame: &mut dyn FnMut(Bytes)) -> AppResult<()> {
        self.buffer.fill(n);
        while let Some(frame_len) = Frame::split(self.buffer.unparsed())? {
            let frame = Bytes::copy_from_slice(&self.buffer.unparsed()[..frame_len]);
            self.buffer.consume(frame_len);
            on_frame(frame);
        }
        Ok(())
    }
}
