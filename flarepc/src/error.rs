use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    SerdeJsonError,
    IllegalMagic,
    IllegalSign,
    BodyTooLarge,
    TcpConnectFailed,
    TcpBindFailed,
    TcpSendMsgFailed,
    TcpRecvMsgFailed,
    TcpParseMsgFailed,
    ClientError,
    ClientTimeout,
    ServerTimeout,
    BadRequest,
    ServiceNotFound,
    ServerError,
    ServerBusy,
    ServiceExpectedError,
    ServiceUnexpectedError,
    DeserializationFail,
    NoConnections,
    NoChannel,
    RegistryNotConnected,
    Shutdown,
    #[serde(untagged)]
    Unknown(String),
}

impl ErrorKind {
    /// Whether a call that failed with this kind provably never reached a provider.
    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            ErrorKind::ClientTimeout
                | ErrorKind::ClientError
                | ErrorKind::TcpSendMsgFailed
                | ErrorKind::NoConnections
                | ErrorKind::NoChannel
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
    /// Address of the peer the failed call was sent to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self {
            kind,
            msg,
            remote: None,
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
            remote: None,
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: impl ToString) -> Self {
        self.remote = Some(remote.to_string());
        self
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(value: std::net::AddrParseError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match value.kind() {
            Io::ConnectionRefused
            | Io::NotConnected
            | Io::TimedOut
            | Io::AddrNotAvailable
            | Io::HostUnreachable
            | Io::NetworkUnreachable => ErrorKind::TcpConnectFailed,
            Io::AddrInUse => ErrorKind::TcpBindFailed,
            Io::BrokenPipe | Io::WriteZero => ErrorKind::TcpSendMsgFailed,
            Io::NotFound | Io::PermissionDenied | Io::InvalidInput | Io::InvalidData => {
                ErrorKind::InvalidArgument
            }
            _ => ErrorKind::TcpRecvMsgFailed,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::SerdeJsonError, value.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorKind::SerializeFailed, value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorKind::DeserializeFailed, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)?;
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)?;
        }
        if let Some(remote) = &self.remote {
            write!(f, " @ {remote}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
