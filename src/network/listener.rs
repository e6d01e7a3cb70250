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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{Connection, Endpoint, FrameCodec};
use crate::{AppError, AppResult, NetworkConfig, Shutdown};

/// Accepts inbound sockets and turns each into a [`Connection`].
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    codec: Arc<dyn FrameCodec>,
    limit_connections: Arc<Semaphore>,
    tcp_nodelay: bool,
    read_timeout: Option<Duration>,
}

impl Listener {
    /// Binds `address` (`host:port`, empty host or `*` for every interface)
    /// with the default network settings.
    pub async fn bind(address: &str, codec: Arc<dyn FrameCodec>) -> AppResult<Listener> {
        Self::bind_with(address, codec, &NetworkConfig::default()).await
    }

    /// Like [`Listener::bind`], taking connection limit, no-delay and read
    /// timeout from `config`. The address is not taken from `config`.
    pub async fn bind_with(
        address: &str,
        codec: Arc<dyn FrameCodec>,
        config: &NetworkConfig,
    ) -> AppResult<Listener> {
        let endpoint = Endpoint::parse(address)?;
        let socket_addr = endpoint.resolve().await?;
        let listener = TcpListener::bind(socket_addr).await.map_err(|err| {
            let error_msg = format!("failed to bind {}: {}", endpoint, err);
            error!("{}", error_msg);
            AppError::Bind(error_msg)
        })?;
        info!(
            "tcp listener binding to {} for {} frames",
            listener.local_addr()?,
            codec.name()
        );
        Ok(Listener {
            listener,
            codec,
            limit_connections: Arc::new(Semaphore::new(config.max_connection)),
            tcp_nodelay: config.tcp_nodelay,
            read_timeout: config.read_timeout(),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts forever. `on_connect` sees every connection before its receive
    /// loop starts, so handlers bound there miss no frame.
    ///
    /// Returns only when accepting keeps failing.
    pub async fn run<F>(&self, on_connect: F) -> AppResult<()>
    where
        F: Fn(&Connection),
    {
        loop {
            let (permit, socket) = self.next_socket().await?;
            self.start_connection(permit, socket, &on_connect);
        }
    }

    /// Like [`Listener::run`], returning `Ok` once `shutdown` fires.
    /// Connections already accepted keep running.
    pub async fn run_until<F>(&self, on_connect: F, mut shutdown: Shutdown) -> AppResult<()>
    where
        F: Fn(&Connection),
    {
        loop {
            let (permit, socket) = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("listener exit accept loop after recv shutdown signal");
                    return Ok(());
                }
                res = self.next_socket() => res?,
            };
            self.start_connection(permit, socket, &on_connect);
        }
    }

    async fn next_socket(&self) -> AppResult<(OwnedSemaphorePermit, TcpStream)> {
        let permit = self
            .limit_connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?;
        let socket = self.accept().await?;
        Ok((permit, socket))
    }

    fn start_connection<F>(&self, permit: OwnedSemaphorePermit, socket: TcpStream, on_connect: &F)
    where
        F: Fn(&Connection),
    {
        if let Err(err) = socket.set_nodelay(self.tcp_nodelay) {
            warn!("failed to set TCP_NODELAY: {}", err);
        }
        let (connection, receive_loop) = match Connection::new(socket, self.codec.clone()) {
            Ok(pair) => pair,
            Err(err) => {
                // the peer is usually gone already
                warn!("drop accepted socket: {}", err);
                return;
            }
        };
        connection.set_read_timeout(self.read_timeout);
        debug!(
            connection_id = connection.id(),
            peer = %connection.peer_addr(),
            "accept new connection"
        );
        on_connect(&connection);

        tokio::spawn(async move {
            if let Err(err) = receive_loop.run().await {
                debug!("receive loop ended with error: {}", err);
            }
            // whether gracefully or unexpectedly closed, release the slot
            drop(permit);
        });
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(err.to_string()));
                    }
                    warn!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Binds `address` and accepts on it until accepting keeps failing.
///
/// Address and bind failures are returned before any connection is accepted.
pub async fn listen<F>(address: &str, codec: Arc<dyn FrameCodec>, on_connect: F) -> AppResult<()>
where
    F: Fn(&Connection),
{
    let listener = Listener::bind(address, codec).await?;
    listener.run(on_connect).await
}

impl Drop for Listener {
    fn drop(&mut self) {
        debug!("tcp listener dropped");
    }
}
