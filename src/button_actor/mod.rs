//! SwitchBot Bot, the "button" automator.
//!
//! Listens on `switchbot/{mac}/press`. See [`ButtonCommand`] for the accepted
//! payloads.

pub mod command;

pub use command::ButtonCommand;

use async_trait::async_trait;
use tracing::info;

use crate::device::{with_retries, BotDevice, ConnectParams, DeviceLibrary};
use crate::framework::{refresh_after_command, Actor, ActorError, ActorKind};
use crate::mqtt::Publisher;
use crate::topic::{
    DeviceIdentity, TopicLevel, TopicTemplate, BATTERY_PERCENTAGE_TOPIC, REQUEST_DEVICE_INFO_TOPIC,
    STATE_TOPIC,
};

pub struct ButtonAutomator {
    identity: DeviceIdentity,
    retry_count: u32,
    password: Option<String>,
    device: Option<Box<dyn BotDevice>>,
}

#[async_trait]
impl Actor for ButtonAutomator {
    const KIND: ActorKind = ActorKind::Button;
    const COMMAND_TOPIC: TopicTemplate = &[
        TopicLevel::Literal("switchbot"),
        TopicLevel::MAC_ADDRESS,
        TopicLevel::Literal("press"),
    ];
    const REQUEST_DEVICE_INFO_TOPIC: TopicTemplate = REQUEST_DEVICE_INFO_TOPIC;
    const STATE_TOPIC: TopicTemplate = STATE_TOPIC;
    const BATTERY_PERCENTAGE_TOPIC: TopicTemplate = BATTERY_PERCENTAGE_TOPIC;

    type Device = dyn BotDevice;
    type Command = ButtonCommand;

    fn new(identity: DeviceIdentity, retry_count: u32, password: Option<String>) -> Self {
        Self {
            identity,
            retry_count,
            password,
            device: None,
        }
    }

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn decode_command(payload: &[u8]) -> Result<ButtonCommand, ActorError> {
        Ok(ButtonCommand::from_payload(payload))
    }

    async fn connect(&mut self, devices: &dyn DeviceLibrary) -> Result<(), ActorError> {
        let params = ConnectParams {
            identity: self.identity.clone(),
            password: self.password.clone(),
            retry_count: self.retry_count,
        };
        let device = devices
            .connect_bot(&params)
            .await
            .map_err(|source| ActorError::DeviceConnect {
                identity: self.identity.clone(),
                source,
            })?;
        self.device = Some(device);
        Ok(())
    }

    fn device(&self) -> Result<&Self::Device, ActorError> {
        self.device
            .as_deref()
            .ok_or_else(|| ActorError::NotConnected(self.identity.clone()))
    }

    async fn execute_command(
        &self,
        payload: &[u8],
        publisher: &dyn Publisher,
        update_device_info: bool,
        topic_prefix: &str,
    ) -> Result<(), ActorError> {
        let command = Self::decode_command(payload)?;
        let device = self.device()?;
        let operation = command.operation();

        with_retries(self.retry_count, operation, || match command {
            ButtonCommand::Press => device.press(),
            ButtonCommand::TurnOn => device.turn_on(),
            ButtonCommand::TurnOff => device.turn_off(),
        })
        .await
        .map_err(|source| ActorError::DeviceOperation {
            identity: self.identity.clone(),
            operation,
            source,
        })?;
        info!(mac = %self.identity, operation, "Switchbot command done");

        self.report_state(command.resulting_state(), publisher, topic_prefix)
            .await;
        if update_device_info {
            refresh_after_command(self, publisher, topic_prefix).await;
        }
        Ok(())
    }
}
