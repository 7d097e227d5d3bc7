use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerError, InboundMessage, MessageStream, Publisher};
use crate::topic::filter_matches;

const EVENT_LOOP_CAPACITY: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Broker address and credentials.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub client_id: String,
}

impl MqttConfig {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

type Routes = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>>;

fn lock(routes: &Routes) -> MutexGuard<'_, Vec<(String, mpsc::UnboundedSender<InboundMessage>)>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// rumqttc-backed [`Broker`]. Cheap to clone.
#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
    routes: Routes,
}

/// Drives the connection and fans inbound publishes out to subscriptions.
pub struct MqttEventLoop {
    event_loop: EventLoop,
    routes: Routes,
}

impl MqttBroker {
    /// Connects and waits for the broker's CONNACK.
    ///
    /// The returned [`MqttEventLoop`] must be polled via [`MqttEventLoop::run`]
    /// for any message to flow.
    pub async fn connect(config: &MqttConfig) -> Result<(Self, MqttEventLoop), BrokerError> {
        info!(
            host = %config.host,
            port = config.port,
            tls = if config.tls { "enabled" } else { "disabled" },
            "Connecting to MQTT broker"
        );
        let (client, mut event_loop) = AsyncClient::new(config.options(), EVENT_LOOP_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, establish_connection(&mut event_loop))
            .await
            .map_err(|_| BrokerError::ConnectTimeout)??;
        debug!(host = %config.host, port = config.port, "Connected to MQTT broker");

        let routes = Routes::default();
        let broker = Self {
            client,
            routes: routes.clone(),
        };
        Ok((broker, MqttEventLoop { event_loop, routes }))
    }

    /// Sends DISCONNECT; the event loop then finishes with `Ok(())`.
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .disconnect()
            .await
            .map_err(|err| BrokerError::Connection(err.to_string()))
    }
}

async fn establish_connection(event_loop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                if code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(BrokerError::Rejected(format!("{code:?}")));
            }
            Ok(notification) => {
                debug!(?notification, "Bootstrap phase notification");
            }
            Err(err) => return Err(BrokerError::Connection(err.to_string())),
        }
    }
}

#[async_trait]
impl Publisher for MqttBroker {
    async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        self.client
            .publish(topic.clone(), QoS::AtMostOnce, retain, payload)
            .await
            .map_err(|err| BrokerError::Publish {
                topic,
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, filter: &str) -> Result<MessageStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        // Registered before SUBSCRIBE goes out so retained replays are routed too.
        lock(&self.routes).push((filter.to_string(), sender));
        info!(filter, "Subscribing to MQTT topic");
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|err| BrokerError::Subscribe {
                filter: filter.to_string(),
                reason: err.to_string(),
            })?;
        Ok(receiver)
    }
}

impl MqttEventLoop {
    /// Runs until the connection ends.
    ///
    /// Returns `Ok(())` after a client-initiated disconnect and an error for
    /// everything else; reconnecting is left to the caller.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.route(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker sent DISCONNECT");
                    return Err(BrokerError::Closed);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    return Ok(());
                }
                Ok(notification) => {
                    debug!(?notification, "MQTT notification");
                }
                Err(err) => {
                    error!(error = %err, "MQTT connection lost");
                    return Err(BrokerError::Connection(err.to_string()));
                }
            }
        }
    }

    fn route(&self, message: InboundMessage) {
        let mut routes = lock(&self.routes);
        // Unbounded per-stream queues: a slow device session must not block polling.
        routes.retain(|(filter, sender)| {
            if !filter_matches(filter, &message.topic) {
                return true;
            }
            sender.send(message.clone()).is_ok()
        });
    }
}
