// crates/client/src/transport.rs
//! Streaming transport seam. The connection manager only sees text frames;
//! [`WebSocketTransport`] is the production implementation.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use scanwatch_core::{JobHandle, WatchConfig};

use crate::error::TransportError;

pub type InboundStream = BoxStream<'static, Result<String, TransportError>>;

/// One live connection. The stream ends when the peer closes; dropping the
/// outbound sender closes our side.
pub struct Connection {
    pub inbound: InboundStream,
    pub outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, handle: &JobHandle) -> Result<Connection, TransportError>;
}

pub struct WebSocketTransport {
    ws_base: String,
}

impl WebSocketTransport {
    pub fn new(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.ws_base())
    }

    /// `{ws_base}/ws/{segment}/{jobId}`
    pub fn url_for(&self, handle: &JobHandle) -> String {
        format!(
            "{}/ws/{}/{}",
            self.ws_base,
            handle.kind.route_segment(),
            urlencoding::encode(&handle.job_id)
        )
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, handle: &JobHandle) -> Result<Connection, TransportError> {
        let url = self.url_for(handle);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;
        debug!(%url, "websocket connected");

        let (mut sink, stream) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!("dropping non-UTF-8 binary frame");
                            None
                        }
                    },
                    // Close ends the stream on the next poll; ping/pong are handled by tungstenite.
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Stream {
                        message: e.to_string(),
                    })),
                }
            })
            .boxed();

        Ok(Connection { inbound, outbound })
    }
}
