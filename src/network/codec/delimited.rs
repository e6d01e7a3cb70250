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

use bytes::{BufMut, Bytes, BytesMut};

use crate::AppError::{MalformedProtocol, PacketTooLarge};
use crate::{AppResult, DelimitedConfig};

use super::{CodecParams, FrameCodec, FrameDecoder};

pub const CRLF: &[u8; 2] = b"\r\n";
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Text framing: every message ends with CR LF.
#[derive(Debug, Clone)]
pub struct DelimitedCodec {
    config: DelimitedConfig,
}

impl DelimitedCodec {
    pub fn new(config: DelimitedConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(DelimitedCodec { config })
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self {
        DelimitedCodec {
            config: DelimitedConfig::default(),
        }
    }
}

impl FrameCodec for DelimitedCodec {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(DelimitedDecoder::new(&self.config))
    }

    fn encode(&self, payload: &[u8], _params: &CodecParams) -> AppResult<Bytes> {
        if payload.windows(2).any(|pair| pair == CRLF) {
            return Err(MalformedProtocol(
                "payload contains the CR LF terminator".to_string(),
            ));
        }
        let mut buffer = BytesMut::with_capacity(payload.len() + CRLF.len());
        buffer.put_slice(payload);
        buffer.put_slice(CRLF);
        Ok(buffer.freeze())
    }
}

#[derive(Debug)]
pub struct DelimitedDecoder {
    chunk: Box<[u8]>,
    accumulator: BytesMut,
    max_message_size: usize,
}

impl DelimitedDecoder {
    pub fn new(config: &DelimitedConfig) -> Self {
        DelimitedDecoder {
            chunk: vec![0u8; config.chunk_size].into_boxed_slice(),
            accumulator: BytesMut::new(),
            max_message_size: config.max_message_size,
        }
    }
}

impl FrameDecoder for DelimitedDecoder {
    fn read_buf(&mut self) -> AppResult<&mut [u8]> {
        Ok(&mut self.chunk[..])
    }

    fn advance(&mut self, n: usize, on_frame: &mut dyn FnMut(Bytes)) -> AppResult<()> {
        let chunk = &self.chunk[..n];
        // start of the bytes not yet moved into a frame or the accumulator
        let mut split_at = 0;
        for (i, byte) in chunk.iter().enumerate() {
            if *byte != LF {
                continue;
            }
            if i > 0 && chunk[i - 1] == CR {
                self.accumulator.extend_from_slice(&chunk[split_at..i - 1]);
                on_frame(self.accumulator.split().freeze());
                split_at = i + 1;
            } else if i == 0 && self.accumulator.last() == Some(&CR) {
                // terminator split across two reads
                self.accumulator.truncate(self.accumulator.len() - 1);
                on_frame(self.accumulator.split().freeze());
                split_at = 1;
            }
        }

        if split_at < n {
            self.accumulator.extend_from_slice(&chunk[split_at..]);
            if self.accumulator.len() > self.max_message_size {
                return Err(PacketTooLarge(format!(
                    "{} bytes without a terminator, limit is {}",
                    self.accumulator.len(),
                    self.max_message_size
                )));
            }
        }
        Ok(())
    }
}
