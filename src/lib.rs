//! # wavesock
//!
//! A WebSocket ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455))
//! endpoint library usable in both the client and the server role, with
//! negotiated `permessage-deflate` compression
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)), a per-connection
//! heartbeat engine and an optional client auto-reconnect policy.
//!
//! The crate is organized leaves-first:
//!
//! - [`frame`] / [`codec`]: the wire unit and its streaming parser/serializer,
//!   driven through [`tokio_util::codec::Framed`].
//! - [`extension`]: the negotiation and transform hooks an extension plugs
//!   into; [`deflate`] is the concrete `permessage-deflate` implementation.
//! - [`handshake`]: the HTTP upgrade exchange for both roles, built on
//!   hyper's HTTP/1 connections and upgrade mechanism.
//! - [`connection`]: the connection state machine. Each [`Connection`] runs as
//!   its own task which owns the socket, reassembles messages, answers pings,
//!   runs the heartbeat and the close handshake, and delivers
//!   [`ConnectionEvent`]s over a channel.
//! - [`registry`]: a set of open connections with broadcast and auto-eviction.
//!
//! ## Connecting
//!
//! ```no_run
//! use futures::StreamExt;
//! use wavesock::{Connection, ConnectionEvent, Options};
//!
//! # async fn run() -> wavesock::Result<()> {
//! let io = tokio::net::TcpStream::connect("example.com:80").await?;
//! let (conn, mut events) = Connection::connect(
//!     io,
//!     "ws://example.com/chat".parse()?,
//!     Options::default(),
//! )
//! .await?;
//!
//! conn.send_text("hello").await?;
//! while let Some(event) = events.next().await {
//!     if let ConnectionEvent::Message { data } = event {
//!         println!("got {:?}", data);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Accepting
//!
//! Upgrades are accepted from a hyper service with [`Connection::accept`]: the
//! returned response is handed back to the client while the returned future
//! resolves into the server-side [`Connection`] once the protocol switch
//! completes.

pub mod close;
pub mod codec;
pub mod connection;
pub mod deflate;
pub mod extension;
pub mod frame;
pub mod handshake;
mod mask;
mod options;
pub mod reconnect;
pub mod registry;

pub use close::CloseCode;
pub use connection::{
    Accept, BinaryType, BoxSocket, CloseEvent, Connection, ConnectionEvent, Events,
    MessagePayload, ReadyState, RequestFactory, Role, Socket,
};
pub use deflate::{CompressionLevel, DeflateOptions, PermessageDeflate};
pub use extension::{Extension, Pipeline};
pub use frame::{Frame, OpCode};
pub use handshake::HttpResponse;
pub use options::Options;
pub use reconnect::ReconnectOptions;
pub use registry::Registry;

use thiserror::Error as ThisError;

/// A result type for WebSocket operations, using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or driving a WebSocket connection.
///
/// Variants are fine-grained so call sites can react precisely; the state
/// machine reduces them to an [`ErrorKind`] (and from there to a close code)
/// via [`Error::kind`] and [`Error::close_code`].
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A data frame arrived while a previous fragmented message was still
    /// being reassembled, or a control frame violated fragmentation rules.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived without an opening data frame.
    #[error("invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text payload or close reason was not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// Frame header used a reserved opcode (0x3-0x7, 0xB-0xF).
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// RSV2 or RSV3 was set, or RSV1 was set without a negotiated extension.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived with the FIN bit clear.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("control frame too large")]
    ControlFrameTooLarge,

    /// A server received an unmasked frame from a client.
    #[error("expected a masked frame")]
    ExpectedMaskedFrame,

    /// A client received a masked frame from a server.
    #[error("expected an unmasked frame")]
    ExpectedUnmaskedFrame,

    /// A frame exceeded the configured read limit, or a 64-bit payload
    /// length had its high bit set.
    #[error("frame too large")]
    FrameTooLarge,

    /// A (possibly decompressed) message exceeded the configured cap.
    #[error("message too large")]
    MessageTooLarge,

    /// A close frame had an invalid payload (single byte, or bad reason).
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a code outside the allowed ranges.
    #[error("invalid close code")]
    InvalidCloseCode,

    /// A compressed frame arrived but no compression was negotiated.
    #[error("received compressed frame on a connection without compression")]
    CompressionNotSupported,

    /// The deflate or inflate stream reported corrupt data.
    #[error("compression stream error: {0}")]
    Compression(String),

    /// An extension offer or response could not be parsed or applied.
    #[error("extension negotiation failed: {0}")]
    ExtensionNegotiation(String),

    /// The peer answered the upgrade with an unexpected HTTP status.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The `Upgrade` header is missing or is not `websocket`.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` header is missing or does not contain `upgrade`.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// The `Sec-WebSocket-Key` header is missing from the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Version` header is not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// The server's `Sec-WebSocket-Accept` did not match the expected hash.
    #[error("Sec-WebSocket-Accept mismatch")]
    SecWebSocketAcceptMismatch,

    /// No requested subprotocol is supported, or the server selected a
    /// protocol that was never offered.
    #[error("unsupported subprotocol")]
    UnsupportedSubprotocol,

    /// The request `Origin` did not satisfy the configured origin rule.
    #[error("origin not allowed")]
    OriginNotAllowed,

    /// Only `ws` and `wss` URL schemes are valid for connecting.
    #[error("invalid http scheme")]
    InvalidHttpScheme,

    /// The connection is closed; no further operations are possible.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The endpoint gave up reconnecting after exhausting its attempts.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,

    /// Wraps errors from URL parsing of the connect target.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// Wraps I/O errors from the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps hyper errors from the HTTP upgrade exchange.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// Wraps errors from building the upgrade request or response.
    #[error(transparent)]
    HttpBuild(#[from] hyper::http::Error),
}

/// Coarse classification of an [`Error`], mirroring the handling policy of
/// the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame, reserved bits/opcodes, masking violations. Closes
    /// with 1002.
    Protocol,
    /// Inbound frame or decompressed message over the configured cap.
    /// Closes with 1009.
    MessageTooLarge,
    /// Extension negotiation or stream failure. Closes with 1010 during the
    /// handshake, 1011 afterwards.
    Extension,
    /// Upgrade exchange failure; the upgrade is refused (server) or the
    /// connect attempt aborts (client). Nothing is sent on the wire.
    Handshake,
    /// Transport failure or unexpected end of stream. Reported locally as
    /// 1006; never sent.
    Transport,
    /// Anything else. Closes with 1011.
    Internal,
}

impl Error {
    /// Classifies the error per the state machine's handling policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidFragment
            | Error::InvalidContinuationFrame
            | Error::InvalidUtf8
            | Error::InvalidOpCode(_)
            | Error::ReservedBitsNotZero
            | Error::ControlFrameFragmented
            | Error::ControlFrameTooLarge
            | Error::ExpectedMaskedFrame
            | Error::ExpectedUnmaskedFrame
            | Error::InvalidCloseFrame
            | Error::InvalidCloseCode
            | Error::CompressionNotSupported => ErrorKind::Protocol,

            Error::FrameTooLarge | Error::MessageTooLarge => ErrorKind::MessageTooLarge,

            Error::Compression(_) | Error::ExtensionNegotiation(_) => ErrorKind::Extension,

            Error::InvalidStatusCode(_)
            | Error::InvalidUpgradeHeader
            | Error::InvalidConnectionHeader
            | Error::MissingSecWebSocketKey
            | Error::InvalidSecWebSocketVersion
            | Error::SecWebSocketAcceptMismatch
            | Error::UnsupportedSubprotocol
            | Error::OriginNotAllowed
            | Error::InvalidHttpScheme
            | Error::UrlParse(_)
            | Error::HttpBuild(_) => ErrorKind::Handshake,

            Error::ConnectionClosed
            | Error::ReconnectExhausted
            | Error::Io(_)
            | Error::Http(_) => ErrorKind::Transport,
        }
    }

    /// The close code the state machine reports for this error.
    ///
    /// Transport errors map to 1006, which is only ever reported locally,
    /// never put on the wire.
    pub fn close_code(&self) -> CloseCode {
        match self.kind() {
            ErrorKind::Protocol => CloseCode::Protocol,
            ErrorKind::MessageTooLarge => CloseCode::Size,
            ErrorKind::Extension => CloseCode::Error,
            ErrorKind::Handshake => CloseCode::Protocol,
            ErrorKind::Transport => CloseCode::Abnormal,
            ErrorKind::Internal => CloseCode::Error,
        }
    }
}
