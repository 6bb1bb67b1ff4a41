//! The `permessage-deflate` extension
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! Compression parameters are negotiated during the opening handshake: the
//! client advertises what it supports, the server answers with the accepted
//! parameter list, and both sides configure their deflate/inflate streams
//! accordingly. Two knobs exist per direction:
//!
//! - **Window bits** bound the LZ77 sliding window (8-15). Negotiated values
//!   only take effect on the streams when the `zlib` feature is enabled;
//!   without it the 32 KiB default window is used.
//! - **Context takeover** decides whether the compression dictionary
//!   persists between messages. With `no_context_takeover` the stream is
//!   reset before every message, trading ratio for bounded memory.
//!
//! Per message, the compressor issues a sync flush and drops the trailing
//! `00 00 FF FF` marker; the decompressor re-appends it before inflating.
//! Decompressed output is capped by [`DeflateOptions::max_decompress_size`]
//! to bound the damage of a deflate bomb.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{FlushCompress, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

use crate::{
    connection::Role,
    extension::Extension,
    frame::OpCode,
    Error, Result,
};

/// Compression level, re-exported from `flate2`.
///
/// Levels range 0-9: 0 disables compression work, 6 is the balanced
/// default, 9 trades CPU for ratio.
pub use flate2::Compression as CompressionLevel;

/// Header token of this extension.
pub(crate) const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The marker a sync flush appends and the wire format omits.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Smallest negotiable LZ77 window (256 bytes).
pub const MIN_WINDOW_BITS: u8 = 8;

/// Largest negotiable LZ77 window (32 KiB), also the default.
pub const MAX_WINDOW_BITS: u8 = 15;

/// Default cap on cumulative decompressed output per message: 16 MiB.
pub const DEFAULT_MAX_DECOMPRESS: usize = 16 * 1024 * 1024;

/// Configuration for the `permessage-deflate` extension.
///
/// `server_*` fields constrain the server-to-client direction, `client_*`
/// fields the client-to-server direction, matching the RFC 7692 parameter
/// names. Window bits outside [8, 15] are clamped during negotiation.
#[derive(Clone)]
pub struct DeflateOptions {
    /// Compression level for outgoing messages.
    pub level: CompressionLevel,
    /// Upper bound for the server's compression window, in bits.
    pub server_max_window_bits: Option<u8>,
    /// Upper bound for the client's compression window, in bits.
    pub client_max_window_bits: Option<u8>,
    /// Reset the server's compression context after each message.
    pub server_no_context_takeover: bool,
    /// Reset the client's compression context after each message.
    pub client_no_context_takeover: bool,
    /// Cap on the cumulative decompressed size of a single message.
    pub max_decompress_size: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            server_max_window_bits: None,
            client_max_window_bits: None,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            max_decompress_size: DEFAULT_MAX_DECOMPRESS,
        }
    }
}

impl DeflateOptions {
    /// Sets the compression level.
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Disables context takeover for the server-to-client direction.
    pub fn server_no_context_takeover(mut self) -> Self {
        self.server_no_context_takeover = true;
        self
    }

    /// Disables context takeover for the client-to-server direction.
    pub fn client_no_context_takeover(mut self) -> Self {
        self.client_no_context_takeover = true;
        self
    }

    /// Bounds the server's compression window.
    pub fn with_server_max_window_bits(mut self, bits: u8) -> Self {
        self.server_max_window_bits = Some(bits);
        self
    }

    /// Bounds the client's compression window.
    pub fn with_client_max_window_bits(mut self, bits: u8) -> Self {
        self.client_max_window_bits = Some(bits);
        self
    }

    /// Sets the cap on decompressed message size.
    pub fn with_max_decompress_size(mut self, size: usize) -> Self {
        self.max_decompress_size = size;
        self
    }
}

/// A parsed `permessage-deflate` parameter list.
///
/// Window-bits parameters distinguish "absent" (`None`) from "present
/// without a value" (`Some(None)`) from "present with a value"
/// (`Some(Some(bits))`); a valueless `client_max_window_bits` in an offer
/// means the client can work with whatever window the server picks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_max_window_bits: Option<Option<u8>>,
    pub client_max_window_bits: Option<Option<u8>>,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// Extracts and parses the `permessage-deflate` entry from a
    /// `Sec-WebSocket-Extensions` header that may list several extensions.
    ///
    /// Returns `Ok(None)` when no entry matches; a matching entry that does
    /// not parse is an error.
    pub fn from_header(header: &str) -> Result<Option<Self>> {
        for entry in header.split(',') {
            let entry = entry.trim();
            if entry == PERMESSAGE_DEFLATE || entry.starts_with("permessage-deflate;") {
                return entry.parse().map(Some);
            }
        }
        Ok(None)
    }

    fn parse(input: &str) -> std::result::Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (mut remaining, _) = tag(PERMESSAGE_DEFLATE)(input)?;

        while !remaining.is_empty() {
            let (rest, (key, value)) = Self::parse_param(remaining)?;
            match key {
                "client_no_context_takeover" => this.client_no_context_takeover = true,
                "server_no_context_takeover" => this.server_no_context_takeover = true,
                "server_max_window_bits" => {
                    this.server_max_window_bits = Some(value.map(|v| v.parse().unwrap_or(0)));
                }
                "client_max_window_bits" => {
                    this.client_max_window_bits = Some(value.map(|v| v.parse().unwrap_or(0)));
                }
                _ => {}
            }
            remaining = rest;
        }

        Ok(this)
    }

    /// Parses one `; key[=value]` parameter.
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }

    /// Server side: merges a client offer with the local configuration into
    /// the parameter set to echo.
    ///
    /// Window bits take `min(offered, configured)` clamped to [8, 15] per
    /// direction; the client direction is only constrained when the client
    /// offered the parameter. Context-takeover flags are OR'd.
    pub(crate) fn accept(&self, local: &DeflateOptions) -> DeflateParams {
        let server_max_window_bits = match (self.server_max_window_bits, local.server_max_window_bits)
        {
            (Some(Some(offered)), Some(ours)) => Some(Some(clamp_bits(offered.min(ours)))),
            (Some(Some(offered)), None) => Some(Some(clamp_bits(offered))),
            (Some(None), Some(ours)) | (None, Some(ours)) => Some(Some(clamp_bits(ours))),
            (Some(None), None) | (None, None) => None,
        };

        let client_max_window_bits = match (self.client_max_window_bits, local.client_max_window_bits)
        {
            (Some(Some(offered)), Some(ours)) => Some(Some(clamp_bits(offered.min(ours)))),
            (Some(Some(offered)), None) => Some(Some(clamp_bits(offered))),
            (Some(None), Some(ours)) => Some(Some(clamp_bits(ours))),
            // The parameter may only appear in the response when the client
            // offered it.
            (Some(None), None) | (None, _) => None,
        };

        DeflateParams {
            server_max_window_bits,
            client_max_window_bits,
            server_no_context_takeover: self.server_no_context_takeover
                || local.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover
                || local.client_no_context_takeover,
        }
    }

    /// Client side: checks that a server response only carries acceptable
    /// values.
    pub(crate) fn validate_response(&self) -> Result<()> {
        for bits in [self.server_max_window_bits, self.client_max_window_bits] {
            match bits {
                Some(Some(v)) if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&v) => {
                    return Err(Error::ExtensionNegotiation(format!(
                        "window bits {v} outside [{MIN_WINDOW_BITS}, {MAX_WINDOW_BITS}]"
                    )));
                }
                // A valueless window-bits parameter is only meaningful in an
                // offer, never in a response.
                Some(None) => {
                    return Err(Error::ExtensionNegotiation(
                        "window bits parameter without a value".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn clamp_bits(bits: u8) -> u8 {
    bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS)
}

impl fmt::Display for DeflateParams {
    /// Renders the parameter list exactly as it appears in the
    /// `Sec-WebSocket-Extensions` header.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        if let Some(bits) = self.server_max_window_bits {
            match bits {
                Some(bits) => write!(f, "; server_max_window_bits={bits}")?,
                None => write!(f, "; server_max_window_bits")?,
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            match bits {
                Some(bits) => write!(f, "; client_max_window_bits={bits}")?,
                None => write!(f, "; client_max_window_bits")?,
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

impl FromStr for DeflateParams {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input).map_err(|err| Error::ExtensionNegotiation(err.to_string()))
    }
}

/// A raw-deflate compressor with an internal output buffer.
struct DeflateStream {
    output: BytesMut,
    raw: flate2::Compress,
}

impl DeflateStream {
    fn new(level: CompressionLevel, window_bits: Option<u8>) -> Self {
        #[cfg(feature = "zlib")]
        let raw = match window_bits {
            Some(bits) => flate2::Compress::new_with_window_bits(level, false, bits.max(9)),
            None => flate2::Compress::new(level, false),
        };
        #[cfg(not(feature = "zlib"))]
        let raw = {
            let _ = window_bits;
            flate2::Compress::new(level, false)
        };

        Self {
            output: BytesMut::with_capacity(1024),
            raw,
        }
    }

    /// Drops the dictionary, as required before each message in
    /// no-context-takeover mode.
    fn reset(&mut self) {
        self.raw.reset();
    }

    /// Compresses a whole message payload: writes the input, issues a sync
    /// flush, and strips the trailing `00 00 FF FF` marker.
    fn compress(&mut self, mut input: &[u8]) -> Result<Bytes> {
        while !input.is_empty() {
            let dst = spare_chunk(&mut self.output);

            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let status = self.raw.compress(input, dst, FlushCompress::None);
            let consumed = (self.raw.total_in() - before_in) as usize;
            let written = (self.raw.total_out() - before_out) as usize;

            unsafe { self.output.advance_mut(written) };
            input = &input[consumed..];

            match status {
                Ok(Status::Ok) => {}
                Ok(Status::BufError) if consumed > 0 || written > 0 => {}
                _ => return Err(Error::Compression("corrupt deflate stream".into())),
            }
        }

        self.flush()
    }

    fn flush(&mut self) -> Result<Bytes> {
        let mut flush = FlushCompress::Sync;
        loop {
            let dst = spare_chunk(&mut self.output);

            let before_out = self.raw.total_out();
            self.raw
                .compress(&[], dst, flush)
                .map_err(|err| Error::Compression(err.to_string()))?;
            let written = (self.raw.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };

            if written == 0 {
                if self.output.ends_with(&DEFLATE_TAIL) {
                    let len = self.output.len() - DEFLATE_TAIL.len();
                    self.output.truncate(len);
                }
                return Ok(self.output.split().freeze());
            }
            flush = FlushCompress::None;
        }
    }
}

/// A raw-inflate decompressor with an internal output buffer and an output
/// size cap.
struct InflateStream {
    output: BytesMut,
    raw: flate2::Decompress,
    max_output: usize,
}

impl InflateStream {
    fn new(window_bits: Option<u8>, max_output: usize) -> Self {
        #[cfg(feature = "zlib")]
        let raw = match window_bits {
            Some(bits) => flate2::Decompress::new_with_window_bits(false, bits.max(9)),
            None => flate2::Decompress::new(false),
        };
        #[cfg(not(feature = "zlib"))]
        let raw = {
            let _ = window_bits;
            flate2::Decompress::new(false)
        };

        Self {
            output: BytesMut::with_capacity(1024),
            raw,
            max_output,
        }
    }

    fn reset(&mut self) {
        self.raw.reset(false);
    }

    /// Inflates a whole message payload. The wire payload is followed by the
    /// `00 00 FF FF` tail the compressor stripped.
    fn decompress(&mut self, input: &[u8]) -> Result<Bytes> {
        self.write(input)?;
        self.write(&DEFLATE_TAIL)?;
        self.finish()
    }

    fn write(&mut self, mut input: &[u8]) -> Result<()> {
        while !input.is_empty() {
            let dst = spare_chunk(&mut self.output);

            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let status = self.raw.decompress(input, dst, FlushDecompress::None);
            let consumed = (self.raw.total_in() - before_in) as usize;
            let written = (self.raw.total_out() - before_out) as usize;

            unsafe { self.output.advance_mut(written) };
            input = &input[consumed..];

            if self.output.len() > self.max_output {
                return Err(Error::MessageTooLarge);
            }

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(_) => return Err(Error::Compression("corrupt inflate stream".into())),
            }

            if consumed == 0 && written == 0 {
                // No progress on a non-empty input means the stream stalled.
                return Err(Error::Compression("corrupt inflate stream".into()));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Bytes> {
        loop {
            let dst = spare_chunk(&mut self.output);

            let before_out = self.raw.total_out();
            self.raw
                .decompress(&[], dst, FlushDecompress::Sync)
                .map_err(|err| Error::Compression(err.to_string()))?;
            let written = (self.raw.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };

            if self.output.len() > self.max_output {
                return Err(Error::MessageTooLarge);
            }

            if written == 0 {
                return Ok(self.output.split().freeze());
            }
        }
    }
}

/// Returns a writable view over the buffer's spare capacity, growing it when
/// full.
///
/// The uninitialized bytes are written before `advance_mut` exposes them,
/// matching the contract `flate2` has for its output slices.
fn spare_chunk(buf: &mut BytesMut) -> &mut [u8] {
    if buf.len() == buf.capacity() {
        buf.reserve(1024);
    }
    let spare = buf.spare_capacity_mut();
    unsafe { &mut *(spare as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

/// The `permessage-deflate` extension as a [`Pipeline`] stage.
///
/// Owns the per-connection deflate and inflate streams, created lazily once
/// parameters are negotiated. Window bits and context takeover are applied
/// per direction according to the endpoint's role.
///
/// [`Pipeline`]: crate::extension::Pipeline
pub struct PermessageDeflate {
    role: Role,
    options: DeflateOptions,
    params: Option<DeflateParams>,
    deflate: Option<DeflateStream>,
    inflate: Option<InflateStream>,
}

impl PermessageDeflate {
    /// Creates the extension for an endpoint in `role` with the given
    /// configuration. Parameters remain unset until negotiation.
    pub fn new(role: Role, options: DeflateOptions) -> Self {
        Self {
            role,
            options,
            params: None,
            deflate: None,
            inflate: None,
        }
    }

    /// Window bits for the compressing (own) direction.
    fn own_window_bits(&self, params: &DeflateParams) -> Option<u8> {
        match self.role {
            Role::Client => params.client_max_window_bits.flatten(),
            Role::Server => params.server_max_window_bits.flatten(),
        }
    }

    /// Window bits for the decompressing (peer) direction.
    fn peer_window_bits(&self, params: &DeflateParams) -> Option<u8> {
        match self.role {
            Role::Client => params.server_max_window_bits.flatten(),
            Role::Server => params.client_max_window_bits.flatten(),
        }
    }

    fn own_no_context_takeover(&self, params: &DeflateParams) -> bool {
        match self.role {
            Role::Client => params.client_no_context_takeover,
            Role::Server => params.server_no_context_takeover,
        }
    }

    fn peer_no_context_takeover(&self, params: &DeflateParams) -> bool {
        match self.role {
            Role::Client => params.server_no_context_takeover,
            Role::Server => params.client_no_context_takeover,
        }
    }
}

impl Extension for PermessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn rsv1(&self) -> bool {
        self.params.is_some()
    }

    fn generate_offer(&mut self) -> Option<String> {
        let mut offer = DeflateParams {
            server_max_window_bits: self.options.server_max_window_bits.map(Some),
            // Advertise the parameter even without an explicit bound so the
            // server may pick a window for us.
            client_max_window_bits: Some(self.options.client_max_window_bits),
            server_no_context_takeover: self.options.server_no_context_takeover,
            client_no_context_takeover: self.options.client_no_context_takeover,
        };
        if let Some(Some(bits)) = offer.server_max_window_bits {
            offer.server_max_window_bits = Some(Some(clamp_bits(bits)));
        }
        if let Some(Some(bits)) = offer.client_max_window_bits {
            offer.client_max_window_bits = Some(Some(clamp_bits(bits)));
        }
        Some(offer.to_string())
    }

    fn generate_response(&mut self, offer: &str) -> Result<Option<String>> {
        let Some(offered) = DeflateParams::from_header(offer)? else {
            return Ok(None);
        };

        let accepted = offered.accept(&self.options);
        log::debug!(
            "accepted permessage-deflate for {}: {accepted}",
            self.role
        );
        let rendered = accepted.to_string();
        self.params = Some(accepted);
        Ok(Some(rendered))
    }

    fn activate(&mut self, response: &str) -> Result<()> {
        let Some(params) = DeflateParams::from_header(response)? else {
            // The server declined compression; stay in passthrough mode.
            return Ok(());
        };

        params.validate_response()?;
        log::debug!("activated permessage-deflate for {}: {params}", self.role);
        self.params = Some(params);
        Ok(())
    }

    fn process_outgoing_message(&mut self, opcode: OpCode, payload: Bytes) -> Result<(Bytes, bool)> {
        let Some(params) = self.params.clone() else {
            return Ok((payload, false));
        };
        if opcode.is_control() {
            return Ok((payload, false));
        }

        let level = self.options.level;
        let bits = self.own_window_bits(&params);
        let reset = self.own_no_context_takeover(&params);

        let stream = self
            .deflate
            .get_or_insert_with(|| DeflateStream::new(level, bits));
        if reset {
            stream.reset();
        }

        let compressed = stream.compress(&payload)?;
        Ok((compressed, true))
    }

    fn process_incoming_message(&mut self, payload: Bytes, compressed: bool) -> Result<Bytes> {
        if !compressed {
            return Ok(payload);
        }
        let Some(params) = self.params.clone() else {
            return Err(Error::CompressionNotSupported);
        };

        let max_output = self.options.max_decompress_size;
        let peer_bits = self.peer_window_bits(&params);
        let reset = self.peer_no_context_takeover(&params);

        let stream = self
            .inflate
            .get_or_insert_with(|| InflateStream::new(peer_bits, max_output));
        if reset {
            stream.reset();
        }

        stream.decompress(&payload)
    }

    fn close(&mut self) {
        self.deflate = None;
        self.inflate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated_pair() -> (PermessageDeflate, PermessageDeflate) {
        let mut client = PermessageDeflate::new(Role::Client, DeflateOptions::default());
        let mut server = PermessageDeflate::new(Role::Server, DeflateOptions::default());

        let offer = client.generate_offer().unwrap();
        let response = server.generate_response(&offer).unwrap().unwrap();
        client.activate(&response).unwrap();

        assert!(client.rsv1());
        assert!(server.rsv1());
        (client, server)
    }

    #[test]
    fn parses_full_parameter_list() {
        let params: DeflateParams = "permessage-deflate; client_no_context_takeover; \
             server_max_window_bits=12; client_max_window_bits=10; server_no_context_takeover"
            .parse()
            .unwrap();

        assert!(params.client_no_context_takeover);
        assert!(params.server_no_context_takeover);
        assert_eq!(params.server_max_window_bits, Some(Some(12)));
        assert_eq!(params.client_max_window_bits, Some(Some(10)));
    }

    #[test]
    fn parses_valueless_window_bits() {
        let params: DeflateParams = "permessage-deflate; client_max_window_bits"
            .parse()
            .unwrap();
        assert_eq!(params.client_max_window_bits, Some(None));
        assert_eq!(params.server_max_window_bits, None);
    }

    #[test]
    fn rejects_malformed_lists() {
        assert!("foo; bar=1".parse::<DeflateParams>().is_err());
        assert!("permessage-deflate; client_max_window_bits="
            .parse::<DeflateParams>()
            .is_err());
        assert!(
            "permessage-deflate; server_no_context_takeover client_max_window_bits"
                .parse::<DeflateParams>()
                .is_err()
        );
    }

    #[test]
    fn finds_entry_among_other_extensions() {
        let header = "permessage-foo; x=1, permessage-deflate; server_max_window_bits=11";
        let params = DeflateParams::from_header(header).unwrap().unwrap();
        assert_eq!(params.server_max_window_bits, Some(Some(11)));

        assert!(DeflateParams::from_header("permessage-foo").unwrap().is_none());
    }

    #[test]
    fn display_roundtrips() {
        let params = DeflateParams {
            server_max_window_bits: Some(Some(12)),
            client_max_window_bits: Some(None),
            server_no_context_takeover: true,
            client_no_context_takeover: false,
        };
        let rendered = params.to_string();
        let parsed: DeflateParams = rendered.parse().unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn accept_takes_min_bits_and_ors_takeover() {
        let offer: DeflateParams =
            "permessage-deflate; server_max_window_bits=12; client_max_window_bits=14; \
             client_no_context_takeover"
                .parse()
                .unwrap();

        let local = DeflateOptions::default()
            .with_server_max_window_bits(10)
            .with_client_max_window_bits(15)
            .server_no_context_takeover();

        let accepted = offer.accept(&local);
        assert_eq!(accepted.server_max_window_bits, Some(Some(10)));
        assert_eq!(accepted.client_max_window_bits, Some(Some(14)));
        assert!(accepted.server_no_context_takeover);
        assert!(accepted.client_no_context_takeover);
    }

    #[test]
    fn accept_clamps_window_bits() {
        let offer: DeflateParams = "permessage-deflate; server_max_window_bits=7"
            .parse()
            .unwrap();
        let accepted = offer.accept(&DeflateOptions::default());
        assert_eq!(accepted.server_max_window_bits, Some(Some(8)));
    }

    #[test]
    fn accept_skips_unoffered_client_bits() {
        let offer: DeflateParams = PERMESSAGE_DEFLATE.parse().unwrap();
        let local = DeflateOptions::default().with_client_max_window_bits(10);
        let accepted = offer.accept(&local);
        assert_eq!(accepted.client_max_window_bits, None);
    }

    #[test]
    fn default_offer_advertises_client_bits() {
        let mut ext = PermessageDeflate::new(Role::Client, DeflateOptions::default());
        let offer = ext.generate_offer().unwrap();
        assert_eq!(offer, "permessage-deflate; client_max_window_bits");
    }

    #[test]
    fn activate_rejects_bad_response() {
        let mut ext = PermessageDeflate::new(Role::Client, DeflateOptions::default());
        assert!(ext
            .activate("permessage-deflate; server_max_window_bits=16")
            .is_err());
        assert!(ext
            .activate("permessage-deflate; client_max_window_bits")
            .is_err());
    }

    #[test]
    fn activate_without_entry_stays_passthrough() {
        let mut ext = PermessageDeflate::new(Role::Client, DeflateOptions::default());
        ext.activate("").ok();
        assert!(!ext.rsv1());

        let payload = Bytes::from_static(b"plain");
        let (out, rsv1) = ext
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        assert_eq!(out, payload);
        assert!(!rsv1);
    }

    #[test]
    fn compress_roundtrip() {
        let (mut client, mut server) = negotiated_pair();

        let payload = Bytes::from("the quick brown fox jumps over the lazy dog");
        let (wire, rsv1) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        assert!(rsv1);
        assert!(!wire.ends_with(&DEFLATE_TAIL));

        let restored = server.process_incoming_message(wire, true).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn repetitive_payload_compresses_small() {
        let (mut client, mut server) = negotiated_pair();

        let payload = Bytes::from("a".repeat(10_000));
        let (wire, _) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        assert!(wire.len() < 200, "compressed to {} bytes", wire.len());

        let restored = server.process_incoming_message(wire, true).unwrap();
        assert_eq!(restored.len(), 10_000);
        assert_eq!(restored, payload);
    }

    #[test]
    fn context_takeover_improves_second_message() {
        let (mut client, mut server) = negotiated_pair();

        let payload = Bytes::from("context takeover shares the dictionary between messages");
        let (first, _) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        let (second, _) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        assert!(second.len() < first.len());

        // The decompressor must consume both in order.
        assert_eq!(
            server.process_incoming_message(first, true).unwrap(),
            payload
        );
        assert_eq!(
            server.process_incoming_message(second, true).unwrap(),
            payload
        );
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let options = DeflateOptions::default().client_no_context_takeover();
        let mut client = PermessageDeflate::new(Role::Client, options.clone());
        let mut server = PermessageDeflate::new(Role::Server, DeflateOptions::default());

        let offer = client.generate_offer().unwrap();
        let response = server.generate_response(&offer).unwrap().unwrap();
        client.activate(&response).unwrap();

        let payload = Bytes::from("every message starts from an empty dictionary");
        let (first, _) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        let (second, _) = client
            .process_outgoing_message(OpCode::Text, payload.clone())
            .unwrap();
        assert_eq!(first.len(), second.len());

        assert_eq!(
            server.process_incoming_message(first, true).unwrap(),
            payload
        );
        assert_eq!(
            server.process_incoming_message(second, true).unwrap(),
            payload
        );
    }

    #[test]
    fn decompress_cap_yields_message_too_large() {
        let (mut client, _) = negotiated_pair();
        let mut server = PermessageDeflate::new(
            Role::Server,
            DeflateOptions::default().with_max_decompress_size(8),
        );
        server.params = Some(DeflateParams {
            client_max_window_bits: Some(Some(15)),
            ..Default::default()
        });

        let payload = Bytes::from(vec![0x42u8; 100]);
        let (wire, _) = client
            .process_outgoing_message(OpCode::Binary, payload)
            .unwrap();

        let err = server.process_incoming_message(wire, true).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn incoming_without_rsv1_passes_through() {
        let (_, mut server) = negotiated_pair();
        let payload = Bytes::from_static(b"not compressed");
        let out = server
            .process_incoming_message(payload.clone(), false)
            .unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn empty_message_roundtrip() {
        let (mut client, mut server) = negotiated_pair();
        let (wire, rsv1) = client
            .process_outgoing_message(OpCode::Text, Bytes::new())
            .unwrap();
        assert!(rsv1);
        let restored = server.process_incoming_message(wire, true).unwrap();
        assert!(restored.is_empty());
    }
}
