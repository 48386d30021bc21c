//! Close status codes for the WebSocket closing handshake.
//!
//! A close frame payload starts with a 16-bit big-endian status code,
//! optionally followed by a UTF-8 reason string. The codes defined by
//! [RFC 6455 Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1)
//! are mirrored here; anything else round-trips through [`CloseCode::Other`].

/// Status code carried in a close frame.
///
/// Codes 1005, 1006 and 1015 are reserved by the RFC for local signalling
/// and must never appear on the wire; [`CloseCode::is_reserved`] flags them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    GoingAway,
    /// 1002: the peer violated the WebSocket protocol.
    ProtocolError,
    /// 1003: the endpoint received data it cannot accept (e.g. binary-only
    /// endpoint receiving text).
    Unsupported,
    /// 1005: no status code was present. Reserved, never sent.
    NoStatus,
    /// 1006: the connection dropped without a closing handshake. Reserved,
    /// never sent.
    Abnormal,
    /// 1007: a payload was inconsistent with its message type (e.g. invalid
    /// UTF-8 in a text message).
    UnsupportedPayload,
    /// 1008: a message violated the endpoint's policy.
    PolicyViolation,
    /// 1009: a message was too large to process.
    TooLarge,
    /// 1010: the client expected an extension the server did not negotiate.
    MandatoryExtension,
    /// 1011: the server encountered an unexpected condition.
    ServerError,
    /// 1012: the service is restarting.
    ServiceRestart,
    /// 1013: try again later (e.g. overload).
    TryAgainLater,
    /// 1014: a gateway received an invalid response upstream.
    BadGateway,
    /// 1015: the TLS handshake failed. Reserved, never sent.
    TlsHandshakeFail,
    /// Any code not listed above, carried verbatim.
    Other(u16),
}

impl CloseCode {
    /// Returns `true` for codes the RFC reserves for local use; these must
    /// not be written into a close frame.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshakeFail
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::UnsupportedPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::TooLarge,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::ServerError,
            1012 => CloseCode::ServiceRestart,
            1013 => CloseCode::TryAgainLater,
            1014 => CloseCode::BadGateway,
            1015 => CloseCode::TlsHandshakeFail,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::UnsupportedPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::TooLarge => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::ServerError => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::TlsHandshakeFail => 1015,
            CloseCode::Other(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_defined_codes() {
        for code in 1000..=1015u16 {
            if code == 1004 {
                // 1004 is unassigned and maps through Other
                assert_eq!(CloseCode::from(code), CloseCode::Other(1004));
                continue;
            }
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn test_other_codes_carried_verbatim() {
        assert_eq!(CloseCode::from(3000), CloseCode::Other(3000));
        assert_eq!(u16::from(CloseCode::Other(4999)), 4999);
    }

    #[test]
    fn test_reserved_codes() {
        assert!(CloseCode::NoStatus.is_reserved());
        assert!(CloseCode::Abnormal.is_reserved());
        assert!(CloseCode::TlsHandshakeFail.is_reserved());
        assert!(!CloseCode::Normal.is_reserved());
        assert!(!CloseCode::ProtocolError.is_reserved());
    }
}
