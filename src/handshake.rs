//! The HTTP upgrade exchange
//! ([RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4)).
//!
//! The server path validates the client's upgrade request (version, key,
//! `Upgrade`/`Connection` tokens), negotiates the subprotocol, origin and
//! extension parameters, and produces the `101 Switching Protocols`
//! response. The client path builds the upgrade request over an existing
//! byte stream using hyper's HTTP/1 client connection, then validates the
//! server's response, including the `Sec-WebSocket-Accept` hash.
//!
//! TLS is out of scope here: the stream handed to [`client_handshake`] may
//! already be encrypted by the caller.

use base64::prelude::*;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    body::Incoming,
    header::{self, HeaderMap},
    upgrade::{OnUpgrade, Upgraded},
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::{extension::Pipeline, options::Options, Error, Result};

/// The fixed GUID appended to the client key when deriving
/// `Sec-WebSocket-Accept`.
pub(crate) const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The HTTP response sent back to the client during a WebSocket upgrade.
///
/// The body is empty; after the handshake the connection leaves HTTP
/// entirely.
pub type HttpResponse = Response<Empty<Bytes>>;

/// The stream a completed upgrade yields, for either role.
pub(crate) type UpgradedIo = TokioIo<Upgraded>;

/// Parameters fixed by the handshake, consumed by the connection driver.
#[derive(Debug, Default, Clone)]
pub(crate) struct Negotiated {
    /// The selected subprotocol, if any.
    pub protocol: Option<String>,
    /// The raw negotiated `Sec-WebSocket-Extensions` value, if any.
    pub extensions: Option<String>,
}

/// Everything the server learns from a validated upgrade request.
#[derive(Debug)]
pub(crate) struct ServerUpgrade {
    pub response: HttpResponse,
    pub negotiated: Negotiated,
    pub on_upgrade: OnUpgrade,
    pub path: String,
    pub origin: Option<String>,
    pub forwarded_ip: Option<String>,
}

/// Computes `Sec-WebSocket-Accept` for a client key:
/// `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates the client's `Sec-WebSocket-Key`: 16 random bytes, base64.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Case-insensitive equality against a header value.
fn header_eq(headers: &HeaderMap, name: header::HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Case-insensitive token search in a comma-separated header value, as
/// needed for `Connection: keep-alive, Upgrade`.
fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Picks the subprotocol to echo: the first token of the client's
/// `Sec-WebSocket-Protocol` list that the application supports
/// (case-insensitive).
///
/// With no configured protocols the negotiation is skipped entirely. With
/// configured protocols and no matching token the upgrade is refused.
pub(crate) fn select_subprotocol(
    supported: &[String],
    requested: Option<&str>,
) -> Result<Option<String>> {
    if supported.is_empty() {
        return Ok(None);
    }

    if let Some(requested) = requested {
        for token in requested.split(',') {
            let token = token.trim();
            if let Some(found) = supported
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(token))
            {
                return Ok(Some(found.clone()));
            }
        }
    }

    Err(Error::UnsupportedSubprotocol)
}

/// Applies the configured origin rule: the request `Origin` must equal the
/// configured origin, or the request `Host` must be a substring of it.
pub(crate) fn check_origin(
    configured: Option<&str>,
    origin: Option<&str>,
    host: Option<&str>,
) -> Result<()> {
    let Some(configured) = configured else {
        return Ok(());
    };

    if origin.is_some_and(|origin| origin == configured) {
        return Ok(());
    }
    if host.is_some_and(|host| configured.contains(host)) {
        return Ok(());
    }

    Err(Error::OriginNotAllowed)
}

/// Extracts the peer IP advertised by a proxy, the first entry of
/// `x-forwarded-for`.
pub(crate) fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Validates a client upgrade request and produces the switching-protocols
/// response plus the negotiated parameters.
///
/// The extension pipeline participates through
/// [`generate_response`](crate::Extension::generate_response); a stage that
/// accepts the offer has its parameters echoed in
/// `Sec-WebSocket-Extensions`.
pub(crate) fn negotiate_server<B>(
    request: &mut Request<B>,
    options: &Options,
    pipeline: &mut Pipeline,
) -> Result<ServerUpgrade> {
    let headers = request.headers();

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|value| value.as_bytes())
        != Some(b"13")
    {
        return Err(Error::InvalidSecWebSocketVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .filter(|value| !value.is_empty())
        .ok_or(Error::MissingSecWebSocketKey)?;

    if !header_eq(headers, header::UPGRADE, "websocket") {
        return Err(Error::InvalidUpgradeHeader);
    }
    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(Error::InvalidConnectionHeader);
    }

    let protocol = select_subprotocol(
        &options.protocols,
        headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok()),
    )?;

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    check_origin(options.origin.as_deref(), origin.as_deref(), host)?;

    let offer = headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|value| value.to_str().ok());
    let extensions = match offer {
        Some(offer) => pipeline.generate_response(offer)?,
        None => None,
    };

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()));

    if let Some(protocol) = &protocol {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
    }
    if let Some(extensions) = &extensions {
        builder = builder.header(header::SEC_WEBSOCKET_EXTENSIONS, extensions.as_str());
    }

    let response = builder.body(Empty::new())?;

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let forwarded = forwarded_ip(request.headers());
    let on_upgrade = hyper::upgrade::on(request);

    Ok(ServerUpgrade {
        response,
        negotiated: Negotiated {
            protocol,
            extensions,
        },
        on_upgrade,
        path,
        origin,
        forwarded_ip: forwarded,
    })
}

/// Builds the client's upgrade request for `url`.
fn build_client_request(
    url: &Url,
    options: &Options,
    key: &str,
    offer: Option<String>,
) -> Result<Request<Empty<Bytes>>> {
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::InvalidHttpScheme);
    }

    let host = url.host_str().ok_or(Error::InvalidHttpScheme)?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let target = &url[url::Position::BeforePath..];
    let mut builder = Request::builder()
        .method("GET")
        .uri(target)
        .header(header::HOST, host_header)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .header(header::SEC_WEBSOCKET_VERSION, "13");

    if !options.protocols.is_empty() {
        builder = builder.header(
            header::SEC_WEBSOCKET_PROTOCOL,
            options.protocols.join(", "),
        );
    }
    if let Some(origin) = &options.origin {
        builder = builder.header(header::ORIGIN, origin.as_str());
    }
    if let Some(offer) = offer {
        builder = builder.header(header::SEC_WEBSOCKET_EXTENSIONS, offer);
    }

    Ok(builder.body(Empty::new())?)
}

/// Validates the server's upgrade response against what the client sent.
fn verify_server_response<B>(
    response: &Response<B>,
    options: &Options,
    key: &str,
    pipeline: &mut Pipeline,
) -> Result<Negotiated> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::InvalidStatusCode(response.status().as_u16()));
    }

    let headers = response.headers();
    if !header_eq(headers, header::UPGRADE, "websocket") {
        return Err(Error::InvalidUpgradeHeader);
    }
    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(Error::InvalidConnectionHeader);
    }

    let expected = accept_key(key.as_bytes());
    let accept = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok());
    if accept != Some(expected.as_str()) {
        return Err(Error::SecWebSocketAcceptMismatch);
    }

    let protocol = match headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
    {
        Some(selected) => {
            // The server may only pick something we offered.
            let offered = options
                .protocols
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(selected));
            Some(offered.ok_or(Error::UnsupportedSubprotocol)?.clone())
        }
        None => None,
    };

    let extensions = headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(extensions) = &extensions {
        pipeline.activate(extensions)?;
    }

    Ok(Negotiated {
        protocol,
        extensions,
    })
}

/// Runs the client side of the upgrade over an established byte stream.
///
/// The stream is handed to a hyper HTTP/1 client connection; once the
/// server answers `101` and the response validates, the upgraded stream and
/// the negotiated parameters are returned.
pub(crate) async fn client_handshake<S>(
    io: S,
    url: &Url,
    options: &Options,
    pipeline: &mut Pipeline,
) -> Result<(UpgradedIo, Negotiated)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let key = generate_key();
    let offer = pipeline.generate_offer();
    let request = build_client_request(url, options, &key, offer)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            log::error!("upgrade connection task failed: {err:?}");
        }
    });

    let mut response: Response<Incoming> = sender.send_request(request).await?;
    let negotiated = verify_server_response(&response, options, &key, pipeline)?;

    let upgraded = hyper::upgrade::on(&mut response).await?;
    Ok((TokioIo::new(upgraded), negotiated))
}
