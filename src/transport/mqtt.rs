//! MQTT broker transport over rumqttc.
//!
//! Connection settings come straight from `[connection]`, `[tls]` and
//! `[will]`. The event loop is driven from [`Transport::recv`]; rumqttc
//! reconnects on the next poll after a failure, so recovery here is a
//! bounded backoff plus re-subscribing once the broker acknowledges the new
//! session.

use std::path::Path;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    TlsConfiguration,
};
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};

use super::{ConnectOptions, DEFAULT_RECV_TIMEOUT, InboundMessage, Transport, TransportError};
use crate::config::{ConnectionConfig, TlsConfig};
use crate::model::QoS;

/// Capacity of the request queue between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `disconnect` waits for the DISCONNECT packet to go out.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Transport connected to an MQTT broker.
pub struct MqttTransport {
    session: Option<Session>,
    recv_timeout: Duration,
    reconnect: ReconnectPolicy,
    /// Consecutive connection failures since the last CONNACK.
    failures: u32,
    subscriptions: Vec<(String, QoS)>,
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("connected", &self.session.is_some())
            .field("reconnect", &self.reconnect)
            .field("failures", &self.failures)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            session: None,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            reconnect: ReconnectPolicy::from_config(&ConnectionConfig::default()),
            failures: 0,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn on_connection_error(
        &mut self,
        err: ConnectionError,
    ) -> Result<Option<InboundMessage>, TransportError> {
        self.failures += 1;
        if !self.reconnect.enabled || self.failures > self.reconnect.retries {
            error!(error = %err, failures = self.failures, "broker connection lost, giving up");
            self.session = None;
            return Err(TransportError::Closed);
        }

        let delay = self.reconnect.backoff(self.failures);
        warn!(
            error = %err,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "broker connection lost, reconnecting"
        );
        tokio::time::sleep(delay).await;
        Ok(None)
    }

    async fn on_connack(&mut self) {
        if self.failures == 0 {
            return;
        }
        info!(after_failures = self.failures, "reconnected to broker");
        self.failures = 0;

        let Some(client) = self.session.as_ref().map(|s| &s.client) else {
            return;
        };
        for (topic, qos) in &self.subscriptions {
            if let Err(e) = client.subscribe(topic.as_str(), mqtt_qos(*qos)).await {
                warn!(topic = %topic, error = %e, "re-subscribe failed");
            }
        }
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self, options: ConnectOptions<'_>) -> Result<(), TransportError> {
        let mqtt_options = mqtt_options(&options).await?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let timeout = options
            .connection
            .connect_timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        match tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_elapsed) => {
                return Err(TransportError::Connect(format!(
                    "no CONNACK within {}s",
                    timeout.as_secs()
                )));
            }
        }

        info!(
            uri = %options.connection.uri(),
            client_id = %options.connection.client_id,
            "connected to broker"
        );
        self.reconnect = ReconnectPolicy::from_config(options.connection);
        self.failures = 0;
        self.subscriptions.clear();
        self.session = Some(Session { client, eventloop });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .client
            .subscribe(topic, mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        let polled = tokio::time::timeout(self.recv_timeout, session.eventloop.poll()).await;

        match polled {
            Err(_elapsed) => Ok(None),
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                Ok(Some(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                self.on_connack().await;
                Ok(None)
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => self.on_connection_error(e).await,
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .client
            .publish(topic, mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Err(e) = session.client.disconnect().await {
            debug!(error = %e, "disconnect request not queued");
            return Ok(());
        }

        // The request only reaches the broker when the event loop runs.
        let flush = async {
            loop {
                match session.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            debug!("broker did not see DISCONNECT before the grace period ended");
        }
        info!("disconnected from broker");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Reconnect behaviour after the session drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReconnectPolicy {
    enabled: bool,
    retries: u32,
    max_interval: Duration,
}

impl ReconnectPolicy {
    fn from_config(connection: &ConnectionConfig) -> Self {
        Self {
            enabled: connection.auto_reconnect,
            retries: connection.reconnect_retries,
            max_interval: Duration::from_secs(connection.reconnect_max_interval),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ...
    /// capped at the configured maximum.
    fn backoff(&self, attempt: u32) -> Duration {
        let secs = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_interval)
    }
}

fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Translate connection settings into rumqttc options.
async fn mqtt_options(options: &ConnectOptions<'_>) -> Result<MqttOptions, TransportError> {
    let connection = options.connection;
    if connection.client_id.trim().is_empty() || connection.client_id.starts_with(' ') {
        return Err(TransportError::Connect(
            "client_id must be non-empty and must not start with a space".to_string(),
        ));
    }
    let (host, port) = connection
        .broker_address()
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let mut mqtt = MqttOptions::new(connection.client_id.clone(), host, port);
    mqtt.set_clean_session(connection.clean_session);
    if connection.keep_alive > 0 {
        mqtt.set_keep_alive(Duration::from_secs(connection.keep_alive));
    }
    if let Some(username) = &connection.username {
        let password = options
            .password()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default();
        mqtt.set_credentials(username.clone(), password);
    }
    if let Some(will) = options.will {
        mqtt.set_last_will(LastWill::new(
            will.topic.clone(),
            will.message.clone().into_bytes(),
            mqtt_qos(will.qos),
            will.retain,
        ));
    }
    if options.tls.is_enabled() {
        let ca = load_ca(options.tls).await?;
        mqtt.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }
    Ok(mqtt)
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Concatenate every configured CA source into one PEM bundle.
async fn load_ca(tls: &TlsConfig) -> Result<Vec<u8>, TransportError> {
    let mut bundle = Vec::new();

    if let Some(file) = &tls.cafile {
        append_pem(&mut bundle, file).await?;
    }
    if let Some(dir) = &tls.capath {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| tls_error(dir, e))?;
        let mut certs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| tls_error(dir, e))? {
            let path = entry.path();
            if matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("pem" | "crt")
            ) {
                certs.push(path);
            }
        }
        certs.sort();
        for cert in &certs {
            append_pem(&mut bundle, cert).await?;
        }
    }
    if let Some(data) = &tls.cadata {
        bundle.extend_from_slice(data.as_bytes());
        bundle.push(b'\n');
    }

    if bundle.is_empty() {
        return Err(TransportError::Connect(
            "TLS enabled but no CA certificates were found".to_string(),
        ));
    }
    Ok(bundle)
}

async fn append_pem(bundle: &mut Vec<u8>, path: &Path) -> Result<(), TransportError> {
    let pem = tokio::fs::read(path).await.map_err(|e| tls_error(path, e))?;
    bundle.extend_from_slice(&pem);
    bundle.push(b'\n');
    Ok(())
}

fn tls_error(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::Connect(format!("cannot read CA {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn options_for(config: &str) -> Config {
        Config::from_toml_str(config).unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = ReconnectPolicy {
            enabled: true,
            retries: 10,
            max_interval: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn reconnect_policy_follows_connection_settings() {
        let config = options_for(
            "[connection]\nauto_reconnect = false\nreconnect_retries = 5\nreconnect_max_interval = 3\n",
        );
        let policy = ReconnectPolicy::from_config(&config.connection);
        assert!(!policy.enabled);
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.max_interval, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn options_carry_session_settings() {
        let config = options_for(
            r#"
            [connection]
            uri = "mqtt://broker.local:1884"
            client_id = "worker-7"
            keep_alive = 25
            clean_session = false
            username = "svc"
            password = "hunter2"

            [will]
            topic = "workers/status"
            message = "offline"
            qos = 1
            "#,
        );
        let mqtt = mqtt_options(&ConnectOptions::from_config(&config))
            .await
            .unwrap();

        assert_eq!(mqtt.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(mqtt.client_id(), "worker-7");
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(25));
        assert!(!mqtt.clean_session());
        assert!(mqtt.last_will().is_some());
        assert!(matches!(mqtt.transport(), rumqttc::Transport::Tcp));
    }

    #[tokio::test]
    async fn inline_ca_enables_tls() {
        let config = options_for(
            "[tls]\ncadata = \"-----BEGIN CERTIFICATE-----\\nAAAA\\n-----END CERTIFICATE-----\"\n",
        );
        let mqtt = mqtt_options(&ConnectOptions::from_config(&config))
            .await
            .unwrap();

        assert!(matches!(mqtt.transport(), rumqttc::Transport::Tls(_)));
    }

    #[tokio::test]
    async fn ca_sources_are_bundled_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.pem"), "second").unwrap();
        std::fs::write(dir.path().join("a.crt"), "first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let tls = TlsConfig {
            capath: Some(dir.path().to_path_buf()),
            cadata: Some("inline".to_string()),
            ..TlsConfig::default()
        };

        let bundle = load_ca(&tls).await.unwrap();

        assert_eq!(String::from_utf8(bundle).unwrap(), "first\nsecond\ninline\n");
    }

    #[tokio::test]
    async fn missing_ca_file_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = TlsConfig {
            cafile: Some(dir.path().join("absent.pem")),
            ..TlsConfig::default()
        };

        assert!(matches!(load_ca(&tls).await, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn empty_client_id_is_rejected() {
        let config = options_for("[connection]\nclient_id = \"\"\n");

        assert!(matches!(
            mqtt_options(&ConnectOptions::from_config(&config)).await,
            Err(TransportError::Connect(_))
        ));
    }
}
