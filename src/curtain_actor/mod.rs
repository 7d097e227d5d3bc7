//! SwitchBot Curtain motor.
//!
//! Listens on `switchbot/{mac}/set-position` for movement keywords and
//! target positions (see [`CurtainCommand`]). In addition to state and
//! battery, the curtain reports its last known position on
//! `switchbot/{mac}/position`.

pub mod command;
pub mod error;

pub use command::CurtainCommand;
pub use error::*;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::device::{with_retries, ConnectParams, CurtainDevice, DeviceLibrary};
use crate::framework::{Actor, ActorError, ActorKind};
use crate::mqtt::Publisher;
use crate::topic::{
    DeviceIdentity, TopicLevel, TopicTemplate, BATTERY_PERCENTAGE_TOPIC, REQUEST_DEVICE_INFO_TOPIC,
    STATE_TOPIC,
};

/// `switchbot/{mac}/position`
pub const POSITION_TOPIC: TopicTemplate = &[
    TopicLevel::Literal("switchbot"),
    TopicLevel::MAC_ADDRESS,
    TopicLevel::Literal("position"),
];

pub struct CurtainMotor {
    identity: DeviceIdentity,
    retry_count: u32,
    password: Option<String>,
    device: Option<Box<dyn CurtainDevice>>,
}

impl CurtainMotor {
    async fn report_position(&self, publisher: &dyn Publisher, topic_prefix: &str) -> Result<(), ActorError> {
        match self.device()?.position() {
            Some(percent) => {
                self.publish(
                    POSITION_TOPIC,
                    percent.to_string().into_bytes(),
                    publisher,
                    topic_prefix,
                )
                .await;
            }
            None => warn!(mac = %self.identity, "Curtain position unknown, not reporting"),
        }
        Ok(())
    }

    async fn report_device_info(
        &self,
        publisher: &dyn Publisher,
        topic_prefix: &str,
        with_position: bool,
    ) -> Result<(), ActorError> {
        self.update_device_info().await?;
        self.report_battery(publisher, topic_prefix).await;
        if with_position {
            self.report_position(publisher, topic_prefix).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for CurtainMotor {
    const KIND: ActorKind = ActorKind::Curtain;
    const COMMAND_TOPIC: TopicTemplate = &[
        TopicLevel::Literal("switchbot"),
        TopicLevel::MAC_ADDRESS,
        TopicLevel::Literal("set-position"),
    ];
    const REQUEST_DEVICE_INFO_TOPIC: TopicTemplate = REQUEST_DEVICE_INFO_TOPIC;
    const STATE_TOPIC: TopicTemplate = STATE_TOPIC;
    const BATTERY_PERCENTAGE_TOPIC: TopicTemplate = BATTERY_PERCENTAGE_TOPIC;

    type Device = dyn CurtainDevice;
    type Command = CurtainCommand;

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

    fn decode_command(payload: &[u8]) -> Result<CurtainCommand, ActorError> {
        Ok(CurtainCommand::from_payload(payload)?)
    }

    async fn connect(&mut self, devices: &dyn DeviceLibrary) -> Result<(), ActorError> {
        let params = ConnectParams {
            identity: self.identity.clone(),
            password: self.password.clone(),
            retry_count: self.retry_count,
        };
        let device = devices
            .connect_curtain(&params)
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
            CurtainCommand::Open => device.open(),
            CurtainCommand::Close => device.close(),
            CurtainCommand::Stop => device.stop(),
            CurtainCommand::SetPosition(percent) => device.set_position(percent),
        })
        .await
        .map_err(|source| ActorError::DeviceOperation {
            identity: self.identity.clone(),
            operation,
            source,
        })?;
        info!(mac = %self.identity, ?command, "Switchbot curtain command done");

        self.report_state(&command.resulting_state(), publisher, topic_prefix)
            .await;
        if update_device_info {
            if let Err(err) = self
                .report_device_info(publisher, topic_prefix, command.position_settled())
                .await
            {
                warn!(kind = %Self::KIND, mac = %self.identity, error = %err, "Device info refresh failed");
            }
        }
        Ok(())
    }

    async fn update_and_report_device_info(
        &self,
        publisher: &dyn Publisher,
        topic_prefix: &str,
    ) -> Result<(), ActorError> {
        self.report_device_info(publisher, topic_prefix, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::framework::mock::{EventLog, MockBroker, MockDeviceLibrary};

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    struct Fixture {
        log: EventLog,
        devices: MockDeviceLibrary,
        broker: MockBroker,
    }

    impl Fixture {
        fn new() -> Self {
            let log = EventLog::default();
            Self {
                devices: MockDeviceLibrary::new(log.clone()),
                broker: MockBroker::new(log.clone()),
                log,
            }
        }

        async fn actor(&self) -> CurtainMotor {
            let mut actor = CurtainMotor::new(MAC.parse().unwrap(), 3, Some("secret".into()));
            actor.connect(&self.devices).await.unwrap();
            actor
        }
    }

    #[tokio::test]
    async fn set_position_reports_target() {
        let fixture = Fixture::new();
        let actor = fixture.actor().await;

        actor
            .execute_command(b"42", &fixture.broker, false, "")
            .await
            .unwrap();

        assert_eq!(fixture.log.operations(), ["set_position(42)"]);
        assert_eq!(
            fixture.log.published(),
            [("switchbot/aa:bb:cc:dd:ee:ff/state".to_string(), "42".to_string())]
        );
    }

    #[tokio::test]
    async fn stop_clears_state_and_reports_position() {
        let fixture = Fixture::new();
        fixture.devices.set_battery(MAC, 55);
        fixture.devices.set_position(MAC, 30);
        let actor = fixture.actor().await;

        actor
            .execute_command(b"STOP", &fixture.broker, true, "")
            .await
            .unwrap();

        assert_eq!(
            fixture.log.published(),
            [
                ("switchbot/aa:bb:cc:dd:ee:ff/state".to_string(), String::new()),
                ("switchbot/aa:bb:cc:dd:ee:ff/battery-percentage".to_string(), "55".to_string()),
                ("switchbot/aa:bb:cc:dd:ee:ff/position".to_string(), "30".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn open_refreshes_battery_only() {
        let fixture = Fixture::new();
        fixture.devices.set_battery(MAC, 55);
        fixture.devices.set_position(MAC, 30);
        let actor = fixture.actor().await;

        actor
            .execute_command(b"open", &fixture.broker, true, "")
            .await
            .unwrap();

        let topics: Vec<String> = fixture.log.published().into_iter().map(|(topic, _)| topic).collect();
        assert_eq!(
            topics,
            [
                "switchbot/aa:bb:cc:dd:ee:ff/state",
                "switchbot/aa:bb:cc:dd:ee:ff/battery-percentage",
            ]
        );
    }

    #[tokio::test]
    async fn device_info_update_skips_unknown_values() {
        let fixture = Fixture::new();
        let actor = fixture.actor().await;

        actor
            .update_and_report_device_info(&fixture.broker, "")
            .await
            .unwrap();

        assert_eq!(fixture.log.operations(), ["update"]);
        assert!(fixture.log.published().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let fixture = Fixture::new();
        fixture.devices.script(MAC, "close", [Err(DeviceError::Rejected(0x03))]);
        let actor = fixture.actor().await;

        let result = actor.execute_command(b"CLOSE", &fixture.broker, true, "").await;

        assert!(matches!(
            result,
            Err(ActorError::DeviceOperation {
                source: DeviceError::Rejected(0x03),
                ..
            })
        ));
        assert_eq!(fixture.log.operations(), ["close"]);
        assert!(fixture.log.published().is_empty());
    }

    #[test]
    fn invalid_payloads_fail_to_decode() {
        assert!(matches!(
            CurtainMotor::decode_command(b"250"),
            Err(ActorError::Curtain(CurtainError::InvalidPosition(250)))
        ));
    }
}
