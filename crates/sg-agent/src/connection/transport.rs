//! Authenticated websocket transport
//!
//! Owns one socket. Reading and writing run on separate tasks so a slow
//! write never delays inbound frames (and vice versa).

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use sg_core::ConnectionError;
use sg_protocol::PROTOCOL_VERSION;

/// Handshake header carrying the protocol version
const PROTOCOL_HEADER: &str = "x-streamgate-protocol";

/// Events produced by the reader task
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame
    Text(String),
    /// A binary frame
    Binary(Bytes),
    /// A websocket control pong
    Pong,
    /// The socket closed; no more events follow
    Closed { code: Option<u16>, reason: String },
}

/// An open websocket
pub struct Transport {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Open and authenticate a websocket.
    ///
    /// The credential is sent as a bearer token in the handshake request.
    pub async fn connect(
        endpoint: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), ConnectionError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential)).map_err(|_| {
            ConnectionError::InvalidEndpoint("credential is not a valid header value".to_string())
        })?;
        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(
            HeaderName::from_static(PROTOCOL_HEADER),
            HeaderValue::from_static(PROTOCOL_VERSION),
        );

        tracing::debug!("Connecting to {}", endpoint);
        let (socket, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(classify_handshake_error)?;

        let (mut write, mut read) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::debug!("Websocket write failed: {}", e);
                    return;
                }
                if closing {
                    return;
                }
            }
            // All senders dropped: close politely
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            let closed = loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => TransportEvent::Text(text.to_string()),
                    Some(Ok(Message::Binary(data))) => TransportEvent::Binary(data),
                    Some(Ok(Message::Pong(_))) => TransportEvent::Pong,
                    // tungstenite answers control pings on its own
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => break match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        },
                        None => TransportEvent::Closed {
                            code: None,
                            reason: "closed without status".to_string(),
                        },
                    },
                    Some(Err(e)) => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        }
                    }
                    None => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        }
                    }
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            };
            let _ = event_tx.send(closed);
        });

        Ok((
            Self {
                outbound,
                reader,
                writer,
            },
            event_rx,
        ))
    }

    /// Queue a text frame. Returns false once the socket is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Message::Text(text.into())).is_ok()
    }

    /// Queue a websocket control ping
    pub fn send_ping(&self) -> bool {
        self.outbound.send(Message::Ping(Bytes::new())).is_ok()
    }

    /// Start a graceful close handshake
    pub fn close(&self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    /// Drop the socket immediately, without a close handshake
    pub fn terminate(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // The writer drains queued frames and closes on its own once
        // `outbound` is dropped; the reader would otherwise linger until the
        // peer closes.
        self.reader.abort();
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ConnectionError::AuthRejected {
                    status: status.as_u16(),
                }
            } else {
                ConnectionError::Handshake(format!("HTTP {}", status))
            }
        }
        tungstenite::Error::Url(e) => ConnectionError::InvalidEndpoint(e.to_string()),
        other => ConnectionError::Handshake(other.to_string()),
    }
}
