//! Push transport seam. The connection manager only sees `Connector` and
//! `Link`; `ws` provides the WebSocket implementation.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::models::RideId;
use crate::session::Credentials;

pub mod ws;

/// Close code sent on (and recognized as) a deliberate disconnect.
pub const MANUAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub ride_id: RideId,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError>;
}

/// One open transport. `recv` yields frames until the peer closes or the link fails.
#[async_trait]
pub trait Link: Send {
    async fn recv(&mut self) -> Result<Frame, TransportError>;

    async fn close(&mut self, code: u16);
}
