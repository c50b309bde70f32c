//! Close status codes (RFC 6455 section 7.4).

use std::fmt;

use crate::Role;

/// Status code carried by a close frame.
///
/// Codes are grouped in three classes:
///
/// - sendable: `1000-1003`, `1007-1014` and the application range `3000-4999`
/// - reserved: `1004`, `1005`, `1006`, `1015` and the rest of `1016-2999`, never put on the wire
/// - invalid: anything below `1000` or above `4999`
///
/// [`CloseCode::Status`] (1005) is still used locally to describe a close frame without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002, the peer violated the protocol.
    Protocol,
    /// 1003, the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005, no status code was present in the close frame.
    Status,
    /// 1006, the connection was closed without a close frame.
    Abnormal,
    /// 1007, a message contained data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008, a message violates the endpoint's policy.
    Policy,
    /// 1009, a message is too big to process.
    Size,
    /// 1010, the client expected the server to negotiate an extension.
    Extension,
    /// 1011, the server encountered an unexpected condition.
    Error,
    /// 1012, the service is restarting.
    Restart,
    /// 1013, try again later.
    Again,
    /// 1014, a gateway received an invalid upstream response.
    BadGateway,
    /// 1015, the TLS handshake failed.
    Tls,
    /// Other codes of the reserved range `1016-2999`.
    Reserved(u16),
    /// Application defined codes, `3000-4999`.
    Library(u16),
    /// Codes outside of any defined range.
    Bad(u16),
}

impl CloseCode {
    /// Returns true when this code may be put on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_) | Self::Bad(_)
        )
    }

    /// Returns true for the reserved codes, which are never sent.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_)
        )
    }

    /// Returns true when an endpoint with `role` may send this code.
    ///
    /// `1010` is meaningful only from a client and `1011` only from a server.
    pub fn is_allowed_for(self, role: Role) -> bool {
        match self {
            Self::Extension => role == Role::Client,
            Self::Error => role == Role::Server,
            code => code.is_allowed(),
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1014 => Self::BadGateway,
            1015 => Self::Tls,
            1004 | 1016..=2999 => Self::Reserved(code),
            3000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
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
            CloseCode::BadGateway => 1014,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code) | CloseCode::Library(code) | CloseCode::Bad(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}
