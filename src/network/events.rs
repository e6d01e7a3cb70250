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

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::AppError;

pub type DataHandler = Arc<dyn Fn(Bytes) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&AppError) + Send + Sync>;

/// The events a connection reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// a complete frame arrived
    Data,
    /// the peer closed the stream
    Close,
    /// the connection failed and was closed
    Error,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Data => "data",
            ConnectionEvent::Close => "close",
            ConnectionEvent::Error => "error",
        }
    }
}

impl FromStr for ConnectionEvent {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "data" => Ok(ConnectionEvent::Data),
            "close" => Ok(ConnectionEvent::Close),
            "error" => Ok(ConnectionEvent::Error),
            other => Err(AppError::InvalidValue(format!(
                "unknown connection event: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A handler together with the event it is meant for, so a mismatched pair
/// cannot be built.
#[derive(Clone)]
pub enum EventHandler {
    Data(DataHandler),
    Close(CloseHandler),
    Error(ErrorHandler),
}

impl EventHandler {
    pub fn data(f: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        EventHandler::Data(Arc::new(f))
    }

    pub fn close(f: impl Fn() + Send + Sync + 'static) -> Self {
        EventHandler::Close(Arc::new(f))
    }

    pub fn error(f: impl Fn(&AppError) + Send + Sync + 'static) -> Self {
        EventHandler::Error(Arc::new(f))
    }

    pub fn event(&self) -> ConnectionEvent {
        match self {
            EventHandler::Data(_) => ConnectionEvent::Data,
            EventHandler::Close(_) => ConnectionEvent::Close,
            EventHandler::Error(_) => ConnectionEvent::Error,
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHandler({})", self.event())
    }
}

/// The three handler slots of a connection, no-ops until replaced.
#[derive(Clone)]
pub(crate) struct EventHandlers {
    pub(crate) data: DataHandler,
    pub(crate) close: CloseHandler,
    pub(crate) error: ErrorHandler,
}

impl Default for EventHandlers {
    fn default() -> Self {
        EventHandlers {
            data: Arc::new(|_| {}),
            close: Arc::new(|| {}),
            error: Arc::new(|_| {}),
        }
    }
}

impl EventHandlers {
    pub(crate) fn install(&mut self, handler: EventHandler) {
        match handler {
            EventHandler::Data(f) => self.data = f,
            EventHandler::Close(f) => self.close = f,
            EventHandler::Error(f) => self.error = f,
        }
    }
}
