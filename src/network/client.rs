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
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::{CodecParams, Connection, Endpoint, FrameCodec};
use crate::{AppError, AppResult, ClientConfig};

/// Lifecycle of a [`ReconnectingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// no heartbeat configured, a lost connection stays lost
    Disabled,
    /// heartbeat configured and not given up on: connected and sending
    /// heartbeats, or armed before the first [`ReconnectingClient::connect`]
    Active,
    /// the last dial failed or the connection dropped, redialing
    Reconnecting,
    /// closed by hand, terminal
    Closed,
}

/// Periodic keep-alive written to the active connection.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub interval: Duration,
    /// Written as is, so it must already be framed for the client's codec.
    pub payload: Bytes,
}

impl Heartbeat {
    pub fn new(interval: Duration, payload: impl Into<Bytes>) -> AppResult<Heartbeat> {
        let payload = payload.into();
        if interval.is_zero() {
            return Err(AppError::InvalidValue(
                "heartbeat interval must be greater than 0".to_string(),
            ));
        }
        if payload.is_empty() {
            return Err(AppError::InvalidValue(
                "heartbeat payload must not be empty".to_string(),
            ));
        }
        Ok(Heartbeat { interval, payload })
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `None` disables heartbeat and with it every automatic reconnect.
    pub heartbeat: Option<Heartbeat>,
    /// Wait after a failed reconnect attempt.
    pub reconnect_interval: Duration,
    /// Extra wait after every supervisor iteration, on top of the heartbeat
    /// or reconnect interval.
    pub supervisor_pause: Duration,
    pub tcp_nodelay: bool,
    pub read_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            heartbeat: None,
            reconnect_interval: Duration::from_secs(2),
            supervisor_pause: Duration::ZERO,
            tcp_nodelay: false,
            read_timeout: None,
        }
    }
}

impl TryFrom<&ClientConfig> for ClientOptions {
    type Error = AppError;

    fn try_from(config: &ClientConfig) -> Result<Self, Self::Error> {
        let heartbeat = if config.heartbeat_interval_secs > 0 {
            Some(Heartbeat::new(
                Duration::from_secs(config.heartbeat_interval_secs as u64),
                config.heartbeat_payload.clone(),
            )?)
        } else {
            None
        };
        Ok(ClientOptions {
            heartbeat,
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            supervisor_pause: Duration::from_millis(config.supervisor_pause_ms),
            tcp_nodelay: config.tcp_nodelay,
            read_timeout: (config.read_timeout_secs > 0)
                .then(|| Duration::from_secs(config.read_timeout_secs)),
        })
    }
}

type OnConnect = Arc<dyn Fn(&Connection) + Send + Sync>;

/// A client connection that, with a heartbeat configured, keeps itself alive:
/// a supervisor task sends the heartbeat while connected and redials after the
/// connection is lost, until [`ReconnectingClient::close`] is called.
///
/// Without heartbeat the client dials once per [`ReconnectingClient::connect`]
/// and never retries on its own.
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    codec: Arc<dyn FrameCodec>,
    options: ClientOptions,
    state: AtomicCell<ClientState>,
    target: Mutex<Option<Endpoint>>,
    on_connect: Mutex<Option<OnConnect>>,
    connection: Mutex<Option<Connection>>,
    supervisor_running: AtomicBool,
    closed: CancellationToken,
}

impl ReconnectingClient {
    pub fn new(codec: Arc<dyn FrameCodec>, options: ClientOptions) -> Self {
        let state = if options.heartbeat.is_some() {
            ClientState::Active
        } else {
            ClientState::Disabled
        };
        ReconnectingClient {
            inner: Arc::new(ClientInner {
                codec,
                options,
                state: AtomicCell::new(state),
                target: Mutex::new(None),
                on_connect: Mutex::new(None),
                connection: Mutex::new(None),
                supervisor_running: AtomicBool::new(false),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(codec: Arc<dyn FrameCodec>, config: &ClientConfig) -> AppResult<Self> {
        Ok(Self::new(codec, ClientOptions::try_from(config)?))
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.load()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The connection currently held, possibly already closed.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.lock().clone()
    }

    pub fn is_supervised(&self) -> bool {
        self.inner.supervisor_running.load(Ordering::Acquire)
    }

    /// Dials `address` (`host:port`) and returns the new connection.
    ///
    /// `on_connect` runs for this and every later reconnected connection,
    /// before its receive loop starts. A malformed address fails before any
    /// I/O. A failed dial is always returned; with heartbeat configured the
    /// supervisor keeps redialing in the background.
    pub async fn connect<F>(&self, address: &str, on_connect: F) -> AppResult<Connection>
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let endpoint = Endpoint::parse(address)?;
        if self.state() == ClientState::Closed {
            return Err(AppError::IllegalStateError("client is closed".to_string()));
        }
        *self.inner.target.lock() = Some(endpoint);
        *self.inner.on_connect.lock() = Some(Arc::new(on_connect));

        match self.inner.dial().await {
            Ok(connection) => {
                self.inner.ensure_supervisor();
                Ok(connection)
            }
            Err(err) => {
                warn!("connect to {} failed: {}", address, err);
                self.inner.to_reconnecting();
                self.inner.ensure_supervisor();
                Err(err)
            }
        }
    }

    /// Writes already framed bytes to the current connection.
    pub async fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.current()?.write(data).await
    }

    /// Frames `payload` and writes it to the current connection.
    pub async fn send(&self, payload: &[u8], params: &CodecParams) -> AppResult<usize> {
        self.current()?.send(payload, params).await
    }

    /// Closes the client for good: the supervisor stops, the connection is
    /// closed and nothing is redialed.
    pub fn close(&self) {
        let previous = self.inner.state.swap(ClientState::Closed);
        self.inner.closed.cancel();
        if let Some(connection) = self.inner.connection.lock().take() {
            connection.close();
        }
        if previous != ClientState::Closed {
            info!("client closed in state {:?}", previous);
        }
    }

    fn current(&self) -> AppResult<Connection> {
        self.connection().ok_or_else(|| {
            AppError::IoError(io::Error::new(ErrorKind::NotConnected, "client not connected"))
        })
    }
}

impl fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("state", &self.state())
            .field("target", &*self.inner.target.lock())
            .field("codec", &self.inner.codec.name())
            .finish()
    }
}

impl ClientInner {
    /// Only a configured heartbeat makes a client leave `Active`.
    fn to_reconnecting(&self) -> bool {
        self.state
            .compare_exchange(ClientState::Active, ClientState::Reconnecting)
            .is_ok()
    }

    fn to_active(&self) -> bool {
        self.state
            .compare_exchange(ClientState::Reconnecting, ClientState::Active)
            .is_ok()
    }

    async fn dial(self: &Arc<Self>) -> AppResult<Connection> {
        let endpoint = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| AppError::IllegalStateError("no address to dial".to_string()))?;
        let socket_addr = endpoint.resolve().await?;
        let stream = TcpStream::connect(socket_addr).await?;
        if let Err(err) = stream.set_nodelay(self.options.tcp_nodelay) {
            warn!("failed to set TCP_NODELAY: {}", err);
        }

        let (connection, receive_loop) = Connection::new(stream, self.codec.clone())?;
        connection.set_read_timeout(self.options.read_timeout);
        let on_connect = self.on_connect.lock().clone();
        if let Some(on_connect) = on_connect {
            on_connect(&connection);
        }

        let previous = self.connection.lock().replace(connection.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        // a close racing with this dial must not leave the new connection open
        if self.state.load() == ClientState::Closed {
            if let Some(connection) = self.connection.lock().take() {
                connection.close();
            }
            return Err(AppError::IllegalStateError(
                "client closed while connecting".to_string(),
            ));
        }
        self.to_active();

        let client: Weak<ClientInner> = Arc::downgrade(self);
        let connection_id = connection.id();
        tokio::spawn(async move {
            if let Err(err) = receive_loop.run().await {
                debug!("receive loop ended with error: {}", err);
            }
            if let Some(client) = client.upgrade() {
                client.connection_lost(connection_id);
            }
        });

        info!(
            connection_id,
            "connected to {} via {}",
            socket_addr,
            connection.local_addr()
        );
        Ok(connection)
    }

    fn connection_lost(&self, connection_id: u64) {
        let is_current = self
            .connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.id() == connection_id);
        if is_current && self.to_reconnecting() {
            warn!(connection_id, "connection lost, start reconnecting");
        }
    }

    /// Spawns the supervisor unless heartbeat is off, the client is closed or
    /// one is already running.
    fn ensure_supervisor(self: &Arc<Self>) {
        let Some(heartbeat) = self.options.heartbeat.clone() else {
            return;
        };
        if self.state.load() == ClientState::Closed {
            return;
        }
        if self
            .supervisor_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            client.supervise(heartbeat).await;
        });
    }

    async fn supervise(self: Arc<Self>, heartbeat: Heartbeat) {
        debug!("client supervisor started");
        loop {
            let wait = match self.state.load() {
                ClientState::Active => tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => break,
                    _ = self.send_heartbeat(&heartbeat) => heartbeat.interval,
                },
                ClientState::Reconnecting => tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => break,
                    dialed = self.dial() => match dialed {
                        Ok(connection) => {
                            info!(connection_id = connection.id(), "reconnected");
                            Duration::ZERO
                        }
                        Err(err) => {
                            warn!("reconnect failed: {}", err);
                            self.options.reconnect_interval
                        }
                    },
                },
                ClientState::Closed | ClientState::Disabled => break,
            };
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = time::sleep(wait + self.options.supervisor_pause) => {}
            }
        }
        self.supervisor_running.store(false, Ordering::Release);
        debug!("client supervisor exited");
    }

    async fn send_heartbeat(&self, heartbeat: &Heartbeat) {
        let connection = self.connection.lock().clone();
        let Some(connection) = connection else {
            return;
        };
        if let Err(err) = connection.write(&heartbeat.payload).await {
            if self.closed.is_cancelled() {
                return;
            }
            warn!(
                connection_id = connection.id(),
                "failed to send heartbeat: {}", err
            );
            connection.emit_error(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::DelimitedCodec;

    fn codec() -> Arc<dyn FrameCodec> {
        Arc::new(DelimitedCodec::default())
    }

    #[test]
    fn test_initial_state_follows_heartbeat() {
        let plain = ReconnectingClient::new(codec(), ClientOptions::default());
        assert_eq!(plain.state(), ClientState::Disabled);

        let options = ClientOptions {
            heartbeat: Some(Heartbeat::new(Duration::from_secs(1), "ping\r\n").unwrap()),
            ..Default::default()
        };
        let kept_alive = ReconnectingClient::new(codec(), options);
        assert_eq!(kept_alive.state(), ClientState::Active);
        assert!(!kept_alive.is_supervised());
    }

    #[test]
    fn test_heartbeat_validation() {
        assert!(Heartbeat::new(Duration::ZERO, "x").is_err());
        assert!(Heartbeat::new(Duration::from_secs(1), Bytes::new()).is_err());
    }

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            heartbeat_interval_secs: 3,
            heartbeat_payload: Bytes::from_static(b"hb\r\n"),
            reconnect_interval_ms: 250,
            supervisor_pause_ms: 10,
            read_timeout_secs: 9,
            ..Default::default()
        };
        let options = ClientOptions::try_from(&config).unwrap();
        let heartbeat = options.heartbeat.unwrap();
        assert_eq!(heartbeat.interval, Duration::from_secs(3));
        assert_eq!(heartbeat.payload.as_ref(), b"hb\r\n");
        assert_eq!(options.reconnect_interval, Duration::from_millis(250));
        assert_eq!(options.supervisor_pause, Duration::from_millis(10));
        assert_eq!(options.read_timeout, Some(Duration::from_secs(9)));

        let disabled = ClientOptions::try_from(&ClientConfig::default()).unwrap();
        assert!(disabled.heartbeat.is_none());
        assert!(disabled.read_timeout.is_none());
    }

    #[test]
    fn test_heartbeat_interval_requires_payload() {
        let config = ClientConfig {
            heartbeat_interval_secs: 3,
            ..Default::default()
        };
        assert!(matches!(
            ClientOptions::try_from(&config),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_transitions_never_leave_closed() {
        let options = ClientOptions {
            heartbeat: Some(Heartbeat::new(Duration::from_secs(1), "ping\r\n").unwrap()),
            ..Default::default()
        };
        let client = ReconnectingClient::new(codec(), options);
        assert!(client.inner.to_reconnecting());
        assert_eq!(client.state(), ClientState::Reconnecting);
        assert!(!client.inner.to_reconnecting());
        assert!(client.inner.to_active());
        assert_eq!(client.state(), ClientState::Active);

        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.inner.to_reconnecting());
        assert!(!client.inner.to_active());
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[test]
    fn test_disabled_client_never_reconnects() {
        let client = ReconnectingClient::new(codec(), ClientOptions::default());
        assert!(!client.inner.to_reconnecting());
        assert_eq!(client.state(), ClientState::Disabled);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address_before_dialing() {
        let client = ReconnectingClient::new(codec(), ClientOptions::default());
        let result = client.connect("no-port-here", |_| {}).await;
        assert!(matches!(result, Err(AppError::AddressFormat(_))));
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let client = ReconnectingClient::new(codec(), ClientOptions::default());
        client.close();
        let result = client.connect("127.0.0.1:1", |_| {}).await;
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let client = ReconnectingClient::new(codec(), ClientOptions::default());
        let result = client.write(b"x").await;
        assert!(matches!(result, Err(AppError::IoError(_))));
    }
}
