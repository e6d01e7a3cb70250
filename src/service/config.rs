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

extern crate config as _;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::network::{DelimitedCodec, FrameCodec, LengthPrefixedCodec};

use super::{AppError, AppResult};

/// Which framing convention a listener or client speaks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    LengthPrefixed,
    #[default]
    Delimited,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub tcp_nodelay: bool,
    /// 0 disables the read deadline
    pub read_timeout_secs: u64,
    pub codec: CodecKind,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9898,
            max_connection: 1024,
            tcp_nodelay: false,
            read_timeout_secs: 0,
            codec: CodecKind::default(),
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

/// Buffer policy of the length-prefixed codec.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LengthPrefixedConfig {
    /// The fixed size of the receive buffer.
    pub recv_buffer_capacity: usize,
    /// Compact the buffer before a read when less than this is free at its tail.
    pub min_free_space: usize,
    /// Unparsed bytes above this are rejected as a too large packet.
    pub max_pending: usize,
}

impl Default for LengthPrefixedConfig {
    fn default() -> Self {
        LengthPrefixedConfig {
            recv_buffer_capacity: 100 * 1024,
            min_free_space: 10 * 1024,
            max_pending: 90 * 1024,
        }
    }
}

impl LengthPrefixedConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.min_free_space == 0 {
            return Err(AppError::InvalidValue(
                "min_free_space must be greater than 0".to_string(),
            ));
        }
        if self.max_pending >= self.recv_buffer_capacity {
            return Err(AppError::InvalidValue(format!(
                "max_pending {} must be less than recv_buffer_capacity {}",
                self.max_pending, self.recv_buffer_capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DelimitedConfig {
    /// Bytes requested from the socket per read.
    pub chunk_size: usize,
    /// A message still unterminated past this size is rejected.
    pub max_message_size: usize,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        DelimitedConfig {
            chunk_size: 10 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl DelimitedConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.chunk_size == 0 {
            return Err(AppError::InvalidValue(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub address: String,
    /// 0 disables heartbeat and therefore reconnecting
    pub heartbeat_interval_secs: u32,
    /// Sent as is, it must already be framed for the codec in use.
    pub heartbeat_payload: Bytes,
    pub reconnect_interval_ms: u64,
    /// Extra wait applied after every supervisor iteration.
    pub supervisor_pause_ms: u64,
    pub tcp_nodelay: bool,
    /// 0 disables the read deadline
    pub read_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            address: "127.0.0.1:9898".to_string(),
            heartbeat_interval_secs: 0,
            heartbeat_payload: Bytes::new(),
            reconnect_interval_ms: 2000,
            supervisor_pause_ms: 0,
            tcp_nodelay: false,
            read_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TcpkitConfig {
    pub network: NetworkConfig,
    pub length_prefixed: LengthPrefixedConfig,
    pub delimited: DelimitedConfig,
    pub client: ClientConfig,
}

impl TcpkitConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TcpkitConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let tcpkit_config: TcpkitConfig = config.try_deserialize()?;
        tcpkit_config.length_prefixed.validate()?;
        tcpkit_config.delimited.validate()?;

        Ok(tcpkit_config)
    }

    /// Builds the codec selected by `network.codec`.
    pub fn codec(&self) -> AppResult<Arc<dyn FrameCodec>> {
        let codec: Arc<dyn FrameCodec> = match self.network.codec {
            CodecKind::LengthPrefixed => {
                Arc::new(LengthPrefixedCodec::new(self.length_prefixed.clone())?)
            }
            CodecKind::Delimited => Arc::new(DelimitedCodec::new(self.delimited.clone())?),
        };
        Ok(codec)
    }
}
