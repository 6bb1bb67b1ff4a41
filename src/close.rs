//! Close codes for the WebSocket close handshake, as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close frame carries an optional 2-byte big-endian status code followed by
//! a UTF-8 reason. [`CloseCode`] covers the registered code points, the IANA
//! range and the application-defined (4xxx) range, and knows which codes a
//! peer is allowed to put on the wire.

/// Status code sent or received in a Close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose of the connection was fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: a protocol error was detected.
    Protocol,
    /// 1003: a data type the endpoint cannot accept was received.
    Unsupported,
    /// 1005: reserved; indicates no status code was present. Never sent.
    Status,
    /// 1006: reserved; abnormal closure without a close frame. Never sent,
    /// only reported locally.
    Abnormal,
    /// 1007: a payload was inconsistent with the message type (bad UTF-8).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: try again later, the server is overloaded.
    Again,
    /// 1015: reserved; TLS handshake failure. Never sent.
    Tls,
    /// 1004, 1014 and 1016-2999: reserved for future protocol use.
    Reserved(u16),
    /// 3000-3999: registered with IANA, usable by libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private, application-defined codes.
    Application(u16),
    /// Anything outside the ranges above; never legal on the wire.
    Bad(u16),
}

impl CloseCode {
    /// Whether a peer may legally send this code in a Close frame.
    ///
    /// The reserved codes (1004-1006, 1014-2999 and 1015) and everything
    /// outside the defined ranges are rejected, which surfaces as a protocol
    /// error on the receiving side.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Application(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Application(code),
            _ => CloseCode::Bad(code),
        }
    }
}
