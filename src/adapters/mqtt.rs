use std::time::{Duration, Instant};

use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError};
use thiserror::Error;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Source of raw distance messages. `Ok(None)` means nothing arrived within `wait`.
pub trait SensorFeed: Send + 'static {
    fn next_message(&mut self, wait: Duration) -> Result<Option<SensorMessage>, TransportError>;
}

impl<T: SensorFeed + ?Sized> SensorFeed for Box<T> {
    fn next_message(&mut self, wait: Duration) -> Result<Option<SensorMessage>, TransportError> {
        (**self).next_message(wait)
    }
}

/// Sink for per-spot control payloads. `Ok` means the broker acknowledged delivery.
pub trait CommandPublisher: Send + 'static {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("no broker acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("mqtt event loop closed")]
    Closed,
    #[error("sensor replay failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse sensor replay script: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl BrokerEndpoint {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options
    }
}

/// Subscribes to every spot's distance topic and yields incoming publishes.
/// The event loop reconnects on the next poll after a failure; topics are
/// re-subscribed on each connect acknowledgement.
pub struct MqttSensorFeed {
    client: Client,
    connection: Connection,
    topics: Vec<String>,
}

impl MqttSensorFeed {
    pub fn connect(endpoint: &BrokerEndpoint, topics: Vec<String>) -> Self {
        let (client, connection) = Client::new(endpoint.options(), REQUEST_CHANNEL_CAPACITY);
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            client_id = %endpoint.client_id,
            topics = topics.len(),
            "mqtt sensor feed created"
        );

        Self {
            client,
            connection,
            topics,
        }
    }

    fn subscribe_all(&self) -> Result<(), TransportError> {
        for topic in &self.topics {
            self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce)?;
        }
        tracing::info!(topics = self.topics.len(), "subscribed to spot distance topics");
        Ok(())
    }
}

impl SensorFeed for MqttSensorFeed {
    fn next_message(&mut self, wait: Duration) -> Result<Option<SensorMessage>, TransportError> {
        let event = match self.connection.recv_timeout(wait) {
            Ok(Ok(event)) => event,
            Ok(Err(error)) => return Err(TransportError::Connection(error)),
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
        };

        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.subscribe_all()?;
                Ok(None)
            }
            Event::Incoming(Packet::Publish(publish)) => Ok(Some(SensorMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            _ => Ok(None),
        }
    }
}

/// Publishes control payloads with QoS 1 and waits a bounded time for the
/// acknowledgement. Any failure drops the session so the next publish starts
/// from a fresh connection.
pub struct MqttCommandPublisher {
    endpoint: BrokerEndpoint,
    ack_timeout: Duration,
    session: Option<(Client, Connection)>,
}

impl MqttCommandPublisher {
    pub fn new(endpoint: BrokerEndpoint, ack_timeout: Duration) -> Self {
        Self {
            endpoint,
            ack_timeout,
            session: None,
        }
    }

    fn publish_on_session(
        session: &mut (Client, Connection),
        topic: &str,
        payload: &str,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        let (client, connection) = session;
        client.try_publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())?;

        let deadline = Instant::now() + ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::AckTimeout(ack_timeout));
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(error)) => return Err(TransportError::Connection(error)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::AckTimeout(ack_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }
}

impl CommandPublisher for MqttCommandPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let session = self.session.get_or_insert_with(|| {
            tracing::debug!(client_id = %self.endpoint.client_id, "opening mqtt publish session");
            Client::new(self.endpoint.options(), REQUEST_CHANNEL_CAPACITY)
        });

        let result = Self::publish_on_session(session, topic, payload, self.ack_timeout);
        if result.is_err() {
            self.session = None;
        }

        result
    }
}
