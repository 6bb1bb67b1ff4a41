//! Configuration options for a WebSocket connection.

use std::time::Duration;

use crate::{
    connection::BinaryType,
    deflate::{CompressionLevel, DeflateOptions},
    reconnect::ReconnectOptions,
};

/// Default cap for a single inbound frame or message payload: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default cap for the fragment-reassembly buffer: 2 MiB.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Default chunk size for splitting outgoing messages into frames: 64 KiB.
pub const DEFAULT_WRITE_CHUNK: usize = 64 * 1024;

/// Watchdog for the close handshake: the connection is forced to `Closed`
/// this long after a close was initiated, acknowledged or not.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`Connection`], shared by both roles.
///
/// All options have working defaults; builder methods refine them:
///
/// ```rust
/// use std::time::Duration;
/// use wavesock::{DeflateOptions, Options};
///
/// let options = Options::default()
///     .with_compression(DeflateOptions::default())
///     .with_heartbeat_interval(Duration::from_secs(30))
///     .with_max_payload_read(256 * 1024);
/// ```
///
/// [`Connection`]: crate::Connection
#[derive(Clone, Default)]
pub struct Options {
    /// Maximum size of a single inbound frame payload. Larger frames close
    /// the connection with 1009. Defaults to [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum accumulated size of a fragmented message. Defaults to
    /// [`MAX_READ_BUFFER`] or twice `max_payload_read`, whichever is larger.
    pub max_read_buffer: Option<usize>,

    /// Outgoing messages larger than this are split across continuation
    /// frames. Defaults to [`DEFAULT_WRITE_CHUNK`].
    pub write_chunk_size: Option<usize>,

    /// `permessage-deflate` configuration. `None` disables the extension
    /// entirely (no offer is sent, offers are declined).
    pub compression: Option<DeflateOptions>,

    /// Validate that inbound text messages are well-formed UTF-8 and close
    /// with a protocol error when they are not.
    pub check_utf8: bool,

    /// Server role: the supported subprotocols, in preference order; when
    /// non-empty, clients that offer none of them are refused.
    /// Client role: the subprotocols to offer.
    pub protocols: Vec<String>,

    /// Server role: the origin to require, per the origin rule.
    /// Client role: the `Origin` header to send.
    pub origin: Option<String>,

    /// Interval between heartbeat pings. `None` (or a zero duration)
    /// disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,

    /// How binary message payloads are surfaced to the application.
    pub binary_type: BinaryType,

    /// Client role: the auto-reconnect policy. `None` disables reconnects.
    pub reconnect: Option<ReconnectOptions>,
}

impl Options {
    /// Caps the size of a single inbound frame payload.
    pub fn with_max_payload_read(mut self, size: usize) -> Self {
        self.max_payload_read = Some(size);
        self
    }

    /// Caps the fragment-reassembly buffer.
    pub fn with_max_read_buffer(mut self, size: usize) -> Self {
        self.max_read_buffer = Some(size);
        self
    }

    /// Sets the outgoing fragmentation chunk size.
    pub fn with_write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = Some(size.max(1));
        self
    }

    /// Enables `permessage-deflate` with the given configuration.
    pub fn with_compression(mut self, options: DeflateOptions) -> Self {
        self.compression = Some(options);
        self
    }

    /// Enables `permessage-deflate` and sets its compression level.
    pub fn with_compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression = Some(self.compression.unwrap_or_default().with_level(level));
        self
    }

    /// Disables `permessage-deflate`.
    pub fn without_compression(mut self) -> Self {
        self.compression = None;
        self
    }

    /// Enables strict UTF-8 validation of inbound text messages.
    pub fn with_utf8(mut self) -> Self {
        self.check_utf8 = true;
        self
    }

    /// Sets the supported (server) or offered (client) subprotocols.
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the required (server) or sent (client) origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Arms the heartbeat with the given ping interval. A zero duration
    /// disables it.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Selects how binary payloads are surfaced.
    pub fn with_binary_type(mut self, binary_type: BinaryType) -> Self {
        self.binary_type = binary_type;
        self
    }

    /// Enables client auto-reconnect with the given policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub(crate) fn effective_max_payload(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn effective_read_buffer(&self) -> usize {
        self.max_read_buffer
            .unwrap_or_else(|| MAX_READ_BUFFER.max(self.effective_max_payload() * 2))
    }

    pub(crate) fn effective_write_chunk(&self) -> usize {
        self.write_chunk_size.unwrap_or(DEFAULT_WRITE_CHUNK).max(1)
    }
}
