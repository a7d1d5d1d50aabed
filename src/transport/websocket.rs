//! WebSocket connector: one JSON text message per frame.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Channel, ChannelCore, ChannelError, ChannelFactory, Connector, Frame, SocketChannel};
use crate::config::ChannelConfig;

/// Connects to a relay over `ws://` or `wss://`
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn transport_error(err: impl std::fmt::Display) -> ChannelError {
    ChannelError::Transport(err.to_string())
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn run(
        &self,
        core: &Arc<ChannelCore>,
        outbound: &mut mpsc::UnboundedReceiver<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(transport_error)?;
        let (mut sink, mut source) = stream.split();

        info!("Connected to {}", self.url);
        core.opened();

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        sink.send(Message::Text(frame.encode()?))
                            .await
                            .map_err(transport_error)?;
                    }
                    None => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                        Ok(frame) => core.dispatch(frame),
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Connection closed by server");
                        return Ok(());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping: {} bytes", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(transport_error(e)),
                },
                _ = shutdown.changed() => {
                    while let Ok(frame) = outbound.try_recv() {
                        sink.send(Message::Text(frame.encode()?))
                            .await
                            .map_err(transport_error)?;
                    }
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }
}

/// Opens WebSocket channels from a shared configuration
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    config: ChannelConfig,
}

impl WebSocketFactory {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for WebSocketFactory {
    fn open(&self) -> Arc<dyn Channel> {
        let connector = Arc::new(WebSocketConnector::new(self.config.url.clone()));
        Arc::new(SocketChannel::new(connector, self.config.clone()))
    }
}
