use thiserror::Error;

/// Error type for the SFU. `kind` tells which component failed, `message` carries the detail
/// that is logged but never sent to a client.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub message: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("token error: {0}")]
    TokenError(TokenErrorKind),
    #[error("signaling error: {0}")]
    SignalingError(SignalingErrorKind),
    #[error("transport error: {0}")]
    TransportError(TransportErrorKind),
    #[error("room error: {0}")]
    RoomError(RoomErrorKind),
    #[error("config error: {0}")]
    ConfigError(ConfigErrorKind),
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    HttpError(#[from] reqwest::Error),
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum TokenErrorKind {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unsupported algorithm")]
    InvalidAlgorithm,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid token type")]
    InvalidTokenType,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SignalingErrorKind {
    #[error("join timeout")]
    JoinTimeout,
    #[error("unexpected message")]
    UnexpectedMessage,
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("channel mismatch")]
    ChannelMismatch,
    #[error("blocked")]
    Blocked,
    #[error("forbidden")]
    Forbidden,
    #[error("socket closed")]
    SocketClosed,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum TransportErrorKind {
    #[error("signaling state invalid")]
    SignalingStateInvalid,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RoomErrorKind {
    #[error("room closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ConfigErrorKind {
    #[error("missing value")]
    Missing,
    #[error("invalid value")]
    Invalid,
}

impl Error {
    pub fn new_token(message: String, kind: TokenErrorKind) -> Self {
        Self {
            message,
            kind: ErrorKind::TokenError(kind),
        }
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Self {
        Self {
            message,
            kind: ErrorKind::SignalingError(kind),
        }
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Self {
        Self {
            message,
            kind: ErrorKind::TransportError(kind),
        }
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Self {
        Self {
            message,
            kind: ErrorKind::RoomError(kind),
        }
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Self {
            message,
            kind: ErrorKind::ConfigError(kind),
        }
    }

    /// The generic string placed in an `error` envelope. Token failures all collapse to
    /// `unauthorized` so the client learns nothing about why validation failed.
    pub fn client_message(&self) -> &'static str {
        match &self.kind {
            ErrorKind::TokenError(_) => "unauthorized",
            ErrorKind::SignalingError(kind) => match kind {
                SignalingErrorKind::JoinTimeout => "join timeout",
                SignalingErrorKind::UnexpectedMessage => "expected join",
                SignalingErrorKind::MalformedEnvelope => "invalid message",
                SignalingErrorKind::ChannelMismatch => "channel mismatch",
                SignalingErrorKind::Blocked => "blocked",
                SignalingErrorKind::Forbidden => "forbidden",
                SignalingErrorKind::SocketClosed => "socket closed",
            },
            _ => "internal error",
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Self {
            message: e.to_string(),
            kind: ErrorKind::WebRTCError(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self {
            message: e.to_string(),
            kind: ErrorKind::JsonError(e),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self {
            message: e.to_string(),
            kind: ErrorKind::HttpError(e),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind as JwtKind;

        let kind = match e.kind() {
            JwtKind::ExpiredSignature => TokenErrorKind::Expired,
            JwtKind::InvalidSignature => TokenErrorKind::InvalidSignature,
            JwtKind::InvalidAlgorithm | JwtKind::InvalidAlgorithmName => {
                TokenErrorKind::InvalidAlgorithm
            }
            JwtKind::InvalidIssuer => TokenErrorKind::InvalidIssuer,
            JwtKind::InvalidAudience => TokenErrorKind::InvalidAudience,
            _ => TokenErrorKind::Malformed,
        };
        Self::new_token(e.to_string(), kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_errors_share_one_client_message() {
        let expired = Error::new_token("exp in the past".to_string(), TokenErrorKind::Expired);
        let audience = Error::new_token(
            "aud did not match".to_string(),
            TokenErrorKind::InvalidAudience,
        );
        assert_eq!(expired.client_message(), "unauthorized");
        assert_eq!(audience.client_message(), "unauthorized");
    }

    #[test]
    fn test_signaling_error_client_message() {
        let err = Error::new_signaling("user 7 is blocked".to_string(), SignalingErrorKind::Blocked);
        assert_eq!(err.client_message(), "blocked");
        assert!(err.to_string().contains("user 7 is blocked"));
    }
}
