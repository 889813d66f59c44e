use thiserror::Error;

/// Reasons an inbound push message is dropped instead of forwarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event addressed to ride {0}")]
    ForeignRide(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection attempt timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Protocol(String),

    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Http(String),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid tracking response: {0}")]
    Decode(String),

    #[error("Request timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Gave up reconnecting after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
}
