use std::io;

/// Errors surfaced through the user-facing operations of a connection.
///
/// Completions travel through single-shot channels, so this type is `Clone`;
/// substrate errors are carried by their [`io::ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RudpError {
    #[error("socket is not bound to a local endpoint")]
    NotBound,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("a connect or accept is already in progress")]
    AlreadyStarted,
    #[error("a connection for this remote endpoint already exists")]
    AddressInUse,
    #[error("host not found")]
    HostNotFound,
    #[error("name resolution failed: {0}")]
    NameResolution(String),
    #[error("connect attempt timed out")]
    TimedOut,
    #[error("operation cancelled by connection teardown")]
    Cancelled,
    #[error("i/o error: {0:?}")]
    Io(io::ErrorKind),
}
