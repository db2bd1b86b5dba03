use std::io;

/// Errors produced across the poller, frame codec, and connection engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host does not support an edge-triggered readiness backend.
    #[error("platform not supported: requires epoll (Linux) or kqueue (BSD/macOS)")]
    PlatformUnsupported,

    /// A caller passed a null handler, bad address, or otherwise invalid config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The LenFlags header needs more bytes than are currently buffered.
    ///
    /// Not a hard failure: callers should retain the buffer and retry once more
    /// bytes arrive.
    #[error("header too short")]
    HeaderTooShort,

    /// `encode_len_flags` was given a length outside `[0, 2^29 - 1]`.
    #[error("length out of range for LenFlags header")]
    LengthOutOfRange,

    /// A decoded frame declared a payload larger than `Config::max_payload`.
    #[error("payload too large: {len} bytes exceeds max_payload={max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A frame used a feature the running build does not implement.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    /// zstd decompression failed or a batched pre-image was structurally short.
    #[error("codec error: {0}")]
    CodecError(String),

    /// The connection's write queue is full; the caller must drop, retry, or close.
    #[error("backpressure: write queue exceeds configured bound")]
    Backpressure,

    /// A socket-level failure other than `EAGAIN`/`EWOULDBLOCK`.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    /// True for conditions that are connection-fatal but never server-fatal.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::PayloadTooLarge { .. }
                | Error::UnsupportedFrame(_)
                | Error::CodecError(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
