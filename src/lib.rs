//! HTTP/2 session engine
//!
//! This crate multiplexes concurrent request/response streams over a single
//! bidirectional byte stream according to the HTTP/2 framing and state rules
//! (RFC 7540, draft-14 semantics). It owns connection setup, frame
//! demultiplexing and dispatch, per-stream state machines, header block
//! assembly, flow control and orderly shutdown.
//!
//! # Architecture
//!
//! A [`session::Session`] is constructed around a [`transport::Transport`]
//! (any duplex byte stream that can be split into a read half and a write
//! half) and runs two long-lived threads:
//!
//! - the **read pump**, the only reader of the transport, which decodes
//!   frames and dispatches them synchronously, and
//! - the **write pump**, the only writer, which drains the outgoing queue
//!   and gates `DATA` frames through the flow-control windows.
//!
//! Header compression is a pluggable collaborator behind
//! [`headers::HeaderCodec`]; the default implementation uses the `hpack`
//! crate. TLS, ALPN and request-level application logic live outside the
//! engine; embedders observe the session through [`events::SessionEvent`]
//! notifications.
//!
//! # Example
//!
//! ```no_run
//! use h2session::session::{CancelToken, Role, Session};
//! use std::net::TcpStream;
//!
//! # fn main() -> h2session::error::Result<()> {
//! let stream = TcpStream::connect("example.com:80")?;
//! let session = Session::new(stream, Role::Client, false, CancelToken::new());
//! session.start(None)?;
//!
//! let headers = vec![
//!     (b":method".to_vec(), b"GET".to_vec()),
//!     (b":path".to_vec(), b"/".to_vec()),
//!     (b":scheme".to_vec(), b"http".to_vec()),
//!     (b":authority".to_vec(), b"example.com".to_vec()),
//! ];
//! let stream_id = session.send_request(headers, h2session::DEFAULT_STREAM_PRIORITY, true)?;
//! # let _ = stream_id;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod events;
pub mod flow_control;
pub mod frames;
pub mod headers;
pub mod queue;
pub mod session;
pub mod settings;
pub mod stream;
pub mod transport;

pub use error::{Error, ErrorCode, Result};
pub use events::SessionEvent;
pub use frames::{Frame, FrameFlags, FrameType};
pub use session::{CancelToken, Role, Session};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Default maximum number of concurrent streams advertised locally
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Highest stream priority accepted by the public API
pub const MAX_PRIORITY: u32 = 255;

/// Default priority assigned to new streams (middle of the range)
pub const DEFAULT_STREAM_PRIORITY: u32 = 127;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
