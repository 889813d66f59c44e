use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{ConnectRequest, Connector, Frame, Link};
use crate::error::TransportError;

const TRACKING_PATH: &str = "/ws/tracking";

/// Close code reported when the socket ends without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;
const NO_STATUS_CODE: u16 = 1005;

pub struct WsConnector {
    base_url: Url,
}

impl WsConnector {
    /// `api_base_url` is the HTTP base of the booking API; the socket lives on
    /// the same host with `ws`/`wss` swapped in.
    pub fn new(api_base_url: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(api_base_url)
            .map_err(|e| TransportError::Connect(format!("invalid base url '{api_base_url}': {e}")))?;
        Ok(Self { base_url })
    }
}

/// `{ws|wss}://host/ws/tracking?user_id=..&role=..&booking_id=..`
pub fn tracking_url(base_url: &Url, request: &ConnectRequest) -> Result<Url, TransportError> {
    let mut url = base_url.clone();
    let scheme = match base_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Connect(format!(
                "unsupported url scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Connect(format!("cannot use scheme '{scheme}'")))?;
    url.set_path(TRACKING_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &request.credentials.user_id)
        .append_pair("role", &request.credentials.role)
        .append_pair("booking_id", request.ride_id.as_str());
    Ok(url)
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError> {
        let url = tracking_url(&self.base_url, request)?;
        info!("Connecting to tracking socket: {}", url);

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", request.credentials.token))
            .map_err(|e| TransportError::Connect(format!("invalid token: {e}")))?;
        ws_request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("Tracking socket handshake status: {}", response.status());

        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.into_owned()),
                        None => (NO_STATUS_CODE, String::new()),
                    };
                    return Ok(Frame::Closed { code, reason });
                }
                // Pings are answered by tungstenite on the next read.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
                None => {
                    return Ok(Frame::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "stream ended".to_string(),
                    })
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "client disconnect".into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("Error while closing tracking socket: {}", e);
        }
        if let Err(e) = self.stream.flush().await {
            debug!("Error while flushing tracking socket: {}", e);
        }
    }
}
