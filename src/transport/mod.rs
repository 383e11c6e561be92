//! Publish/subscribe transport seam.
//!
//! The engine only needs connect, subscribe, receive-next, publish and
//! disconnect. [`MqttTransport`] implements them against a real broker;
//! [`ChannelTransport`] implements them over in-process tokio channels for
//! local replays and tests.

pub mod channel;
pub mod mqtt;

use std::future::Future;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::config::{Config, ConnectionConfig, TlsConfig, WillConfig};
use crate::model::QoS;

pub use channel::{ChannelHandle, ChannelTransport};
pub use mqtt::MqttTransport;

/// Default internal receive timeout for the shipped transports.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("not connected")]
    NotConnected,

    /// The transport will never deliver another message.
    #[error("transport closed")]
    Closed,
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message handed to [`Transport::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a transport needs to establish a session.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub connection: &'a ConnectionConfig,
    pub tls: &'a TlsConfig,
    pub will: Option<&'a WillConfig>,
}

impl<'a> ConnectOptions<'a> {
    pub fn from_config(config: &'a Config) -> Self {
        Self {
            connection: &config.connection,
            tls: &config.tls,
            will: config.will.as_ref(),
        }
    }

    pub fn password(&self) -> Option<&'a SecretString> {
        self.connection.password.as_ref()
    }
}

/// Duplex message channel consumed by the engine.
pub trait Transport: Send {
    fn connect(
        &mut self,
        options: ConnectOptions<'_>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next message. Returns `Ok(None)` when nothing arrived
    /// within the transport's internal timeout.
    fn recv(&mut self) -> impl Future<Output = Result<Option<InboundMessage>, TransportError>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
