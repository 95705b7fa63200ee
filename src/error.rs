use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed RESP data: unknown type tag, bad length, truncated frame or
    /// a reply whose shape does not match the command. The wire may be
    /// desynchronized, so the connection is closed.
    #[error("protocol error; {0}")]
    Protocol(String),

    /// Socket-level failure while reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// An `-ERR ...` reply. Carries the server's message verbatim. The
    /// connection stays open.
    #[error("server error: {0}")]
    Server(String),

    /// Command rejected locally because it is illegal in the current mode,
    /// e.g. a non-pubsub command while subscribed, or any command on a
    /// closed client. Nothing reaches the wire.
    #[error("{0}")]
    Mode(&'static str),

    /// Malformed connect options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reconnect loop gave up.
    #[error("reconnect failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl Error {
    /// Whether retry-on-reconnect may recover from this error. Only
    /// transport-level failures qualify; protocol and server errors never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed)
    }
}
