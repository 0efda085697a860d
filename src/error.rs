/// Errors produced by the JBD protocol driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No matching complete frame arrived before the deadline.
    #[error("timeout waiting for response")]
    Timeout,
    /// A caller supplied a value the protocol cannot express.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The checksum embedded in a received frame disagrees with the computed one.
    #[error("checksum mismatch - calculated={expected:02X?} received={received:02X?}")]
    ChecksumMismatch { expected: [u8; 2], received: [u8; 2] },
    /// A frame is too short or structurally inconsistent for its decoder.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A request for this command code is already waiting for its response.
    ///
    /// [`JbdBms`](crate::client::JbdBms) serializes its requests on the transport,
    /// so its own calls queue up instead of failing with this error.
    #[error("request for command {0:#04X} already pending")]
    Busy(u8),
    /// The underlying transport failed to deliver a frame.
    #[error("transport error: {0}")]
    Transport(String),
    /// The notification side of the connection went away.
    #[error("not connected")]
    NotConnected,
}

/// A convenience `Result` alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
