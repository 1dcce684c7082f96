use graylag_common::frame::FrameError;
use thiserror::Error;

/// Errors that can occur while serving policy connections.
#[derive(Error, Debug)]
pub enum ServeError {
    /// The client sent a line the codec refuses.
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    /// The client sent bytes that are not UTF-8.
    #[error("request is not valid utf-8")]
    Encoding,
    /// The client went quiet past the read deadline.
    #[error("read deadline expired")]
    ReadTimeout,
    /// The connection closed before a full request arrived.
    #[error("connection closed mid-request")]
    ConnectionClosed,
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
