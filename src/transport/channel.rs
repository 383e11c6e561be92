//! In-process transport over tokio channels.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ConnectOptions, DEFAULT_RECV_TIMEOUT, InboundMessage, OutboundMessage, Transport,
    TransportError,
};
use crate::model::QoS;

/// In-process transport backed by tokio mpsc channels.
///
/// Messages sent through the paired [`ChannelHandle`] are delivered
/// regardless of topic; subscriptions are only recorded.
#[derive(Debug)]
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    recv_timeout: Duration,
    connected: bool,
    subscriptions: Vec<(String, QoS)>,
}

/// The far end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelHandle {
    inbound: mpsc::UnboundedSender<InboundMessage>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
                connected: false,
                subscriptions: Vec::new(),
            },
            ChannelHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn subscriptions(&self) -> &[(String, QoS)] {
        &self.subscriptions
    }
}

impl Transport for ChannelTransport {
    async fn connect(&mut self, options: ConnectOptions<'_>) -> Result<(), TransportError> {
        debug!(
            uri = %options.connection.uri(),
            client_id = %options.connection.client_id,
            "channel transport connected"
        );
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        match tokio::time::timeout(self.recv_timeout, self.inbound.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TransportError::Closed),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(OutboundMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .map_err(|_| TransportError::Publish {
                topic: topic.to_string(),
                reason: "receiver dropped".to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }
}

impl ChannelHandle {
    /// Deliver a message to the transport. Returns false once the transport
    /// has been dropped.
    pub fn send(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> bool {
        self.inbound
            .send(InboundMessage {
                topic: topic.into(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Next published message, if one is already waiting.
    pub fn try_published(&mut self) -> Option<OutboundMessage> {
        self.outbound.try_recv().ok()
    }

    /// Drain everything published so far.
    pub fn drain_published(&mut self) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| self.try_published()).collect()
    }

    /// Split into the inbound sender and outbound receiver, so the caller can
    /// drop the sender (closing the transport) and keep reading results.
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<InboundMessage>,
        mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        (self.inbound, self.outbound)
    }
}
