use std::io;

/// Close codes a `WebSocketConnection` can send on a protocol violation, see
/// `net::websocket`. Values match the subset of RFC 6455 section 7.4.1 this
/// crate implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    PayloadTooBig = 1004,
    MessageTooBig = 1009,
}

#[derive(Debug)]
pub enum Error {
    /// A read attempted to consume bytes past the buffer's high-water mark.
    ReadPastEnd,
    /// A WebSocket frame or handshake violated the subset of RFC 6455 this crate implements.
    Protocol(CloseCode),
    /// The peer closed the connection or a write could not make progress.
    Disconnected,
    /// `listen`/`connect` could not resolve or bind the given address.
    InvalidAddress,
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ReadPastEnd => write!(f, "read past end of buffer"),
            Error::Protocol(code) => write!(f, "protocol violation, close code {:?}", code),
            Error::Disconnected => write!(f, "connection closed"),
            Error::InvalidAddress => write!(f, "invalid address"),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = ::std::result::Result<T, Error>;
