//! # MQTT Client Capability Set
//!
//! The dispatch engine only needs two things from a broker connection:
//!
//! - [`Publisher`]: send a payload to a topic (retained or not).
//! - [`Broker`]: subscribe to a filter and receive the matching messages as
//!   an ordered stream.
//!
//! [`MqttBroker`] implements both on top of `rumqttc`. Tests use
//! [`crate::framework::mock::MockBroker`].

mod connection;

pub use connection::{MqttBroker, MqttConfig, MqttEventLoop};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker replays a retained message on subscribe.
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Ordered stream of the messages matching one subscription filter.
pub type MessageStream = mpsc::UnboundedReceiver<InboundMessage>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("failed to publish on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to {filter}: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("broker refused connection: {0}")]
    Rejected(String),

    #[error("MQTT connection error: {0}")]
    Connection(String),

    #[error("timed out waiting for the broker to accept the connection")]
    ConnectTimeout,

    #[error("MQTT connection closed")]
    Closed,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Publisher {
    /// Subscribes to `filter` and returns the stream of matching messages.
    async fn subscribe(&self, filter: &str) -> Result<MessageStream, BrokerError>;
}
