use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchbot_mqtt::device::DeviceError;
use switchbot_mqtt::framework::mock::{EventLog, MockBroker, MockDeviceLibrary, MockEvent};
use switchbot_mqtt::framework::{default_registry, DispatchContext, Dispatcher};
use switchbot_mqtt::mqtt::{BrokerError, InboundMessage};
use switchbot_mqtt::settings::{CallbackSettings, DevicePasswords};
use tokio::task::JoinHandle;

const MAC: &str = "aa:bb:cc:dd:ee:ff";

/// A dispatcher running over mocks, subscribed and ready for messages.
struct Harness {
    log: EventLog,
    broker: MockBroker,
    devices: MockDeviceLibrary,
    dispatcher: JoinHandle<Result<(), BrokerError>>,
}

impl Harness {
    async fn start(settings: CallbackSettings) -> Self {
        let log = EventLog::default();
        let broker = MockBroker::new(log.clone());
        let devices = MockDeviceLibrary::new(log.clone());
        let routes = default_registry().routes(settings.fetch_device_info()).len();

        let ctx = DispatchContext::new(settings, Arc::new(broker.clone()), Arc::new(devices.clone()));
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), ctx, default_registry());
        let dispatcher = tokio::spawn(dispatcher.run());
        broker.wait_for_subscriptions(routes).await;

        Self {
            log,
            broker,
            devices,
            dispatcher,
        }
    }

    fn send(&self, topic: &str, payload: &str) -> usize {
        self.broker.deliver(InboundMessage::new(topic, payload))
    }

    /// Closes every stream and waits until all queued messages are handled.
    async fn finish(self) -> EventLog {
        self.broker.close();
        self.dispatcher.await.unwrap().unwrap();
        self.log
    }
}

fn settings(fetch_device_info: bool) -> CallbackSettings {
    CallbackSettings::new(3, DevicePasswords::default(), fetch_device_info, "").unwrap()
}

/// No device session may start while another one is open.
fn assert_sessions_exclusive(events: &[MockEvent]) {
    let mut open: Option<&str> = None;
    for event in events {
        match event {
            MockEvent::Connect { mac, .. } => {
                assert!(open.is_none(), "session on {mac} started while {open:?} was open");
                open = Some(mac.as_str());
            }
            MockEvent::Disconnect { .. } => open = None,
            _ => {}
        }
    }
}

#[tokio::test]
async fn set_position_connects_once_and_publishes_retained_state() {
    let harness = Harness::start(settings(false)).await;

    assert_eq!(harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "42"), 1);

    let log = harness.finish().await;
    assert_eq!(
        log.events(),
        [
            MockEvent::Connect {
                family: "curtain",
                mac: MAC.into(),
                password: None,
            },
            MockEvent::Operation {
                mac: MAC.into(),
                operation: "set_position(42)".into(),
            },
            MockEvent::Published {
                topic: "switchbot/aa:bb:cc:dd:ee:ff/state".into(),
                payload: b"42".to_vec(),
                retain: true,
            },
            MockEvent::Disconnect { mac: MAC.into() },
        ]
    );
}

#[tokio::test]
async fn retained_commands_are_ignored() {
    let harness = Harness::start(settings(true)).await;

    harness
        .broker
        .deliver(InboundMessage::new("switchbot/aa:bb:cc:dd:ee:ff/press", "ON").retained());
    harness
        .broker
        .deliver(InboundMessage::new("switchbot/aa:bb:cc:dd:ee:ff/request-device-info", "").retained());

    let log = harness.finish().await;
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn invalid_mac_never_connects() {
    let harness = Harness::start(settings(true)).await;

    harness.send("switchbot/zz:bb:cc:dd:ee:ff/press", "");
    harness.send("switchbot/aa:bb:cc/set-position", "42");
    harness.send("switchbot/aabbccddeeff00/request-device-info", "");

    let log = harness.finish().await;
    assert_eq!(log.connects(), 0);
    assert!(log.published().is_empty());
}

#[tokio::test]
async fn unexpected_curtain_payload_never_connects() {
    let harness = Harness::start(settings(false)).await;

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "half");
    harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "101");

    let log = harness.finish().await;
    assert_eq!(log.connects(), 0);
}

#[tokio::test]
async fn back_to_back_messages_are_serialized() {
    let harness = Harness::start(settings(false)).await;
    harness.devices.set_operation_delay(Duration::from_millis(20));

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "10");
    harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "90");

    let events = harness.finish().await.events();
    assert_sessions_exclusive(&events);

    let second_connect = events
        .iter()
        .rposition(|event| matches!(event, MockEvent::Connect { .. }))
        .unwrap();
    let first_publish = events
        .iter()
        .position(|event| matches!(event, MockEvent::Published { payload, .. } if payload == b"10"))
        .unwrap();
    assert!(first_publish < second_connect);
}

#[tokio::test]
async fn transient_failures_are_retried_within_one_command() {
    let harness = Harness::start(settings(false)).await;
    harness.devices.script(
        MAC,
        "set_position",
        [Err(DeviceError::Timeout), Err(DeviceError::Transport("aborted".into())), Ok(())],
    );

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/set-position", "42");

    let log = harness.finish().await;
    assert_eq!(log.connects(), 1);
    assert_eq!(log.operations().len(), 3);
    assert_eq!(
        log.published(),
        [("switchbot/aa:bb:cc:dd:ee:ff/state".to_string(), "42".to_string())]
    );
}

#[tokio::test]
async fn device_info_topic_follows_settings() {
    let harness = Harness::start(settings(false)).await;
    assert_eq!(
        harness.broker.subscriptions(),
        ["switchbot/+/press", "switchbot/+/set-position"]
    );
    harness.finish().await;

    let harness = Harness::start(settings(true)).await;
    assert_eq!(
        harness.broker.subscriptions(),
        [
            "switchbot/+/press",
            "switchbot/+/request-device-info",
            "switchbot/+/set-position",
            "switchbot/+/request-device-info",
        ]
    );
    harness.finish().await;
}

#[tokio::test]
async fn device_info_request_reports_battery_and_position() {
    let harness = Harness::start(settings(true)).await;
    harness.devices.set_battery(MAC, 64);
    harness.devices.set_position(MAC, 25);
    harness.devices.set_operation_delay(Duration::from_millis(10));

    // Both actor kinds subscribe to this topic shape.
    assert_eq!(harness.send("switchbot/AA:BB:CC:DD:EE:FF/request-device-info", ""), 2);

    let log = harness.finish().await;
    assert_sessions_exclusive(&log.events());

    let mut published = log.published();
    published.sort();
    assert_eq!(
        published,
        [
            ("switchbot/AA:BB:CC:DD:EE:FF/battery-percentage".to_string(), "64".to_string()),
            ("switchbot/AA:BB:CC:DD:EE:FF/battery-percentage".to_string(), "64".to_string()),
            ("switchbot/AA:BB:CC:DD:EE:FF/position".to_string(), "25".to_string()),
        ]
    );
}

#[tokio::test]
async fn sessions_on_one_device_never_overlap_across_streams() {
    let harness = Harness::start(settings(false)).await;
    harness.devices.set_operation_delay(Duration::from_millis(20));

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", "");
    harness.send("switchbot/aabbccddeeff/set-position", "STOP");
    harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", "OFF");

    let log = harness.finish().await;
    assert_eq!(log.connects(), 3);
    assert_sessions_exclusive(&log.events());
}

#[tokio::test]
async fn failed_connect_does_not_stop_the_stream() {
    let harness = Harness::start(settings(false)).await;
    harness
        .devices
        .fail_connect(MAC, DeviceError::NotFound(MAC.into()));

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", "");
    harness.send("switchbot/11:22:33:44:55:66/press", "");

    let log = harness.finish().await;
    assert_eq!(log.connects(), 2);
    assert_eq!(
        log.published(),
        [("switchbot/11:22:33:44:55:66/state".to_string(), "ON".to_string())]
    );
}

#[tokio::test]
async fn failed_publish_does_not_stop_the_stream() {
    let harness = Harness::start(settings(false)).await;
    harness.broker.fail_publishes(true);

    harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", "");
    harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", "");

    let log = harness.finish().await;
    assert_eq!(log.operations(), ["press", "press"]);
    assert!(log.published().is_empty());
}

#[tokio::test]
async fn passwords_and_prefix_are_applied() {
    let passwords = HashMap::from([("AABBCCDDEEFF".to_string(), "secret".to_string())]);
    let settings = CallbackSettings::new(1, passwords.into(), false, "homeassistant/").unwrap();
    let harness = Harness::start(settings).await;

    assert_eq!(harness.send("switchbot/aa:bb:cc:dd:ee:ff/press", ""), 0);
    harness.send("homeassistant/switchbot/aa:bb:cc:dd:ee:ff/press", "");

    let log = harness.finish().await;
    assert_eq!(
        log.events()[0],
        MockEvent::Connect {
            family: "bot",
            mac: MAC.into(),
            password: Some("secret".into()),
        }
    );
    assert_eq!(
        log.published(),
        [("homeassistant/switchbot/aa:bb:cc:dd:ee:ff/state".to_string(), "ON".to_string())]
    );
}
