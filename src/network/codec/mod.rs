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

//! Framing conventions.
//!
//! A [`FrameCodec`] is shared by every connection speaking the same protocol:
//! it encodes outbound payloads and creates one [`FrameDecoder`] per
//! connection. The decoder holds the per-connection receive state and never
//! touches the socket itself; the connection's receive loop asks it where the
//! next read should land, reads, and hands the byte count back.
//!
//! "Need more bytes" never leaves a decoder. Errors returned by a decoder are
//! fatal for the connection.

use std::fmt::Debug;

use bytes::Bytes;

use crate::AppResult;

pub use delimited::{DelimitedCodec, DelimitedDecoder, CRLF};
pub use length_prefixed::{
    Frame, FrameHeader, LengthPrefixedCodec, LengthPrefixedDecoder, FRAME_VERSION, HEADER_LEN,
};

mod delimited;
mod length_prefixed;

/// Codec specific metadata for an outbound payload.
///
/// Only the length-prefixed codec reads it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub message_type: u8,
    pub target_id: u64,
}

impl CodecParams {
    pub fn with_message_type(message_type: u8) -> Self {
        CodecParams {
            message_type,
            ..Default::default()
        }
    }

    pub fn target_id(mut self, target_id: u64) -> Self {
        self.target_id = target_id;
        self
    }
}

/// Per-connection receive state of a codec.
pub trait FrameDecoder: Send + Debug {
    /// Prepares for the next socket read and returns the region to read into.
    ///
    /// Fails when the bytes waiting for a frame boundary exceed the codec's
    /// ceiling.
    fn read_buf(&mut self) -> AppResult<&mut [u8]>;

    /// Accounts for `n` bytes written into the last [`FrameDecoder::read_buf`]
    /// region and hands every frame completed by them to `on_frame`, in
    /// stream order.
    fn advance(&mut self, n: usize, on_frame: &mut dyn FnMut(Bytes)) -> AppResult<()>;
}

/// A framing convention, also acting as the factory of its decoders.
pub trait FrameCodec: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Fresh receive state for a new connection.
    fn decoder(&self) -> Box<dyn FrameDecoder>;

    /// Wire representation of `payload`.
    fn encode(&self, payload: &[u8], params: &CodecParams) -> AppResult<Bytes>;
}

/// Pushes `chunks` through `decoder` as if each one came from a single socket
/// read, collecting the delivered frames.
#[cfg(test)]
pub(crate) fn decode_chunks<'a>(
    decoder: &mut dyn FrameDecoder,
    chunks: impl IntoIterator<Item = &'a [u8]>,
) -> AppResult<Vec<Bytes>> {
    let mut frames = Vec::new();
    for chunk in chunks {
        let mut rest = chunk;
        while !rest.is_empty() {
            let buf = decoder.read_buf()?;
            let n = buf.len().min(rest.len());
            buf[..n].copy_from_slice(&rest[..n]);
            decoder.advance(n, &mut |frame| frames.push(frame))?;
            rest = &rest[n..];
        }
    }
    Ok(frames)
}
