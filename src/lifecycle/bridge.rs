use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::device::{DeviceError, DeviceLibrary};
use crate::framework::{default_registry, DispatchContext, Dispatcher};
use crate::mqtt::{BrokerError, MqttBroker, MqttConfig, MqttEventLoop};
use crate::settings::{CallbackSettings, ConfigError};

/// Terminal conditions of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("all subscription streams ended")]
    StreamsEnded,
}

/// Validated startup configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    mqtt: MqttConfig,
    settings: CallbackSettings,
}

impl BridgeConfig {
    pub fn new(mqtt: MqttConfig, settings: CallbackSettings) -> Result<Self, ConfigError> {
        if mqtt.password.is_some() && mqtt.username.is_none() {
            return Err(ConfigError::MissingMqttUsername);
        }
        Ok(Self { mqtt, settings })
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn settings(&self) -> &CallbackSettings {
        &self.settings
    }
}

/// The running system: one broker connection and the dispatcher fed by it.
///
/// # Example
///
/// ```ignore
/// let bridge = Bridge::connect(config, devices).await?;
/// let broker = bridge.broker();
/// tokio::select! {
///     result = bridge.run() => result?,
///     _ = tokio::signal::ctrl_c() => broker.disconnect().await?,
/// }
/// ```
pub struct Bridge {
    broker: MqttBroker,
    event_loop: MqttEventLoop,
    dispatcher: Dispatcher,
}

impl Bridge {
    /// Connects to the broker. Nothing is subscribed until [`Bridge::run`].
    pub async fn connect(config: BridgeConfig, devices: Arc<dyn DeviceLibrary>) -> Result<Self, BridgeError> {
        let (broker, event_loop) = MqttBroker::connect(&config.mqtt).await?;
        let shared = Arc::new(broker.clone());
        let ctx = DispatchContext::new(config.settings, shared.clone(), devices);
        let dispatcher = Dispatcher::new(shared, ctx, default_registry());
        Ok(Self {
            broker,
            event_loop,
            dispatcher,
        })
    }

    /// Handle for disconnecting from outside the run loop.
    pub fn broker(&self) -> MqttBroker {
        self.broker.clone()
    }

    pub async fn run(self) -> Result<(), BridgeError> {
        serve(self.dispatcher, self.event_loop.run()).await
    }
}

/// Drives `connection` and `dispatcher` until either ends.
///
/// A connection that finishes cleanly (client-initiated disconnect) yields
/// `Ok(())`. A dropped connection, a subscribe failure or the end of every
/// stream is returned as an error.
pub async fn serve<C>(dispatcher: Dispatcher, connection: C) -> Result<(), BridgeError>
where
    C: Future<Output = Result<(), BrokerError>>,
{
    tokio::select! {
        result = connection => {
            if let Err(err) = &result {
                error!(error = %err, "MQTT connection ended");
            }
            result?;
            info!("Bridge stopped");
            Ok(())
        }
        result = dispatcher.run() => {
            result?;
            Err(BridgeError::StreamsEnded)
        }
    }
}
