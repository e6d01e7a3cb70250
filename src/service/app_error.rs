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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// address errors, always returned before any I/O happens
    #[error("address format error: {0}, expected host:port")]
    AddressFormat(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("Accept error = {0}")]
    Accept(String),

    /// socket errors, including an elapsed read deadline
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// framing errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("packet too large: {0}")]
    PacketTooLarge(String),

    /// marker error, the frame needs more bytes
    #[error("incomplete frame")]
    Incomplete,
}
