/// Errors returned by the conference, its sessions and streams
///
/// Errors with a [`code`](Error::code) below 100 are fatal, the object reporting them is dead and must be
/// torn down by the application. All other errors leave the reporter in a coherent state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("failed to construct element: {0}")]
    Construction(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("unknown codec: {0}")]
    UnknownCodec(String),
    #[error("no codecs: {0}")]
    NoCodecs(String),
    #[error("no codecs left: {0}")]
    NoCodecsLeft(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("object has been disposed: {0}")]
    Disposed(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Numeric error code
    pub fn code(&self) -> u32 {
        match self {
            Error::Construction(..) => 1,
            Error::Internal(..) => 2,
            Error::InvalidArguments(..) => 100,
            Error::Network(..) => 101,
            Error::NotImplemented(..) => 102,
            Error::NegotiationFailed(..) => 103,
            Error::UnknownCodec(..) => 104,
            Error::NoCodecs(..) => 105,
            Error::NoCodecsLeft(..) => 106,
            Error::ConnectionFailed(..) => 107,
            Error::Disposed(..) => 108,
            Error::AlreadyExists(..) => 109,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code() < 100
    }

    pub(crate) fn disposed(what: &str) -> Self {
        Error::Disposed(format!("called on a disposed {what}"))
    }
}
