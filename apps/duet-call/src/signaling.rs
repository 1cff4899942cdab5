use std::time::Duration;

use duet_protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::error::SignalingError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Two halves of a signaling connection, as the call session consumes them.
pub struct SignalingChannel {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingChannel {
    /// A channel backed by plain queues; the caller holds the other ends.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<ServerMessage>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

/// WebSocket connection to the relay. Dropping it aborts its tasks.
pub struct SignalingClient {
    url: Url,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connect to `base` (http(s) or ws(s)) presenting the identity `token`.
    pub async fn connect(
        base: &Url,
        token: &str,
    ) -> Result<(Self, SignalingChannel), SignalingError> {
        let url = websocket_url(base, token)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        tracing::debug!(
            target = "duet::signaling",
            host = ?url.host_str(),
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "duet::signaling", error = %err, "encode failed");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                tracing::debug!(target = "duet::signaling", "signaling closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "duet::signaling", "signaling error: {err}");
                            }
                        }
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "duet::signaling",
                            error = %err,
                            "unrecognised relay message"
                        );
                    }
                }
            }
        });

        let heartbeat_tx = outbound_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                url,
                tasks: vec![writer, reader, heartbeat],
            },
            SignalingChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// `http(s)://host/…` or `ws(s)://host/…` becomes `ws(s)://host/ws?token=…`.
pub fn websocket_url(base: &Url, token: &str) -> Result<Url, SignalingError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SignalingError::Scheme(other.to_string())),
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Scheme(scheme.to_string()))?;
    url.set_path("/ws");
    url.set_fragment(None);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}
