//! Network Module Implementation
//!
//! Message framing over plain TCP streams, for both the accepting and the
//! dialing side.
//!
//! # Architecture
//!
//! The module is built on tokio's async I/O primitives and consists of:
//! - Codecs that split a byte stream into frames and frame outbound payloads
//! - Connections that own a socket, run one receive task each and report
//!   frames, peer close and failures through three replaceable handlers
//! - A listener that turns accepted sockets into connections
//! - A client that can keep its connection alive with heartbeats and redial
//!   after the connection is lost
//!
//! # Components
//!
//! - `FrameCodec` / `FrameDecoder`: framing conventions and their
//!   per-connection receive state
//! - `LengthPrefixedCodec`: 12 byte big-endian header followed by the payload
//! - `DelimitedCodec`: messages terminated by CR LF
//! - `Connection` / `ReceiveLoop`: one framed TCP stream
//! - `Listener`: accept loop with a connection limit
//! - `ReconnectingClient`: dialing side with heartbeat and reconnect
//!
//! # Features
//!
//! - Chunk boundary independent frame extraction
//! - Bounded receive buffers
//! - Read deadlines and timeouts
//! - Per-connection attributes

pub use address::Endpoint;
pub use attributes::{AttrValue, Attributes};
pub use buffer::ReceiveBuffer;
pub use client::{ClientOptions, ClientState, Heartbeat, ReconnectingClient};
pub use codec::{
    CodecParams, DelimitedCodec, DelimitedDecoder, Frame, FrameCodec, FrameDecoder, FrameHeader,
    LengthPrefixedCodec, LengthPrefixedDecoder, CRLF, FRAME_VERSION, HEADER_LEN,
};
pub use connection::{Connection, ReceiveLoop};
pub use events::{CloseHandler, ConnectionEvent, DataHandler, ErrorHandler, EventHandler};
pub use listener::{listen, Listener};

mod address;
mod attributes;
mod buffer;
mod client;
mod codec;
mod connection;
mod events;
mod listener;
