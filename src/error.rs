use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRtc(Arc<webrtc::Error>),
    #[error("malformed message: {0}")]
    Codec(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("messenger has been closed")]
    MessengerClosed,
    #[error("directory request timed out")]
    RequestTimeout,
    #[error("peer connection has been closed")]
    ConnectionClosed,
}

impl Error {
    pub fn connection<S: Into<String>>(reason: S) -> Self {
        Error::Connection(reason.into())
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::WebRtc(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(value.to_string())
    }
}
