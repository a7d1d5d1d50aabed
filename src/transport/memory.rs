//! In-process connector that talks to a `RelayServer` directly.
//!
//! Frames cross the same `mpsc` queues the WebSocket transport uses, so the
//! client runs its full reconnect and ack machinery without a socket.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{Channel, ChannelCore, ChannelError, ChannelFactory, Connector, Frame, SocketChannel};
use crate::config::ChannelConfig;
use crate::server::RelayServer;

/// Connects a channel to an in-process relay
pub struct MemoryConnector {
    relay: Arc<RelayServer>,
}

impl MemoryConnector {
    pub fn new(relay: Arc<RelayServer>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn run(
        &self,
        core: &Arc<ChannelCore>,
        outbound: &mut mpsc::UnboundedReceiver<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let (conn, mut inbound) = self.relay.connect();
        core.opened();

        let result = loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => self.relay.handle_frame(conn, frame),
                    None => break Ok(()),
                },
                frame = inbound.recv() => match frame {
                    Some(frame) => core.dispatch(frame),
                    // The relay dropped this connection
                    None => {
                        debug!("Relay closed connection {}", conn);
                        break Ok(());
                    }
                },
                _ = shutdown.changed() => {
                    while let Ok(frame) = outbound.try_recv() {
                        self.relay.handle_frame(conn, frame);
                    }
                    break Ok(());
                }
            }
        };

        self.relay.disconnect(conn);
        result
    }
}

/// Opens channels to an in-process relay
#[derive(Clone)]
pub struct MemoryFactory {
    relay: Arc<RelayServer>,
    config: ChannelConfig,
}

impl MemoryFactory {
    pub fn new(relay: Arc<RelayServer>, config: ChannelConfig) -> Self {
        Self { relay, config }
    }

    pub fn relay(&self) -> &Arc<RelayServer> {
        &self.relay
    }
}

impl ChannelFactory for MemoryFactory {
    fn open(&self) -> Arc<dyn Channel> {
        let connector = Arc::new(MemoryConnector::new(self.relay.clone()));
        Arc::new(SocketChannel::new(connector, self.config.clone()))
    }
}
