pub mod network;
mod service;

pub use network::{
    listen, ClientOptions, ClientState, CodecParams, Connection, ConnectionEvent,
    DelimitedCodec, EventHandler, FrameCodec, Heartbeat, LengthPrefixedCodec, Listener,
    ReconnectingClient,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, CodecKind,
    DelimitedConfig, LengthPrefixedConfig, NetworkConfig, Shutdown, ShutdownTrigger, TcpkitConfig,
};
