use std::time::Duration;
use thiserror::Error;

/// Failures while opening or driving a device link.
///
/// These never reach callers of `send_message`/`connect`; the transport logs
/// them and reports `false` or moves to the `Error` state.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(String),
    #[error("no serial port found for auto-detection")]
    NoSerialPort,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("frame payload of {0} bytes exceeds the stream limit")]
    FrameTooLarge(usize),
    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("device closed the link during handshake")]
    ClosedDuringHandshake,
    #[error("device finished configuration without reporting its node number")]
    MissingNodeNumber,
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("background task failed: {0}")]
    Task(String),
}
