use std::sync::Arc;

use switchbot_mqtt::framework::mock::{EventLog, MockBroker, MockDeviceLibrary};
use switchbot_mqtt::framework::{default_registry, DispatchContext, Dispatcher};
use switchbot_mqtt::lifecycle::{serve, BridgeError};
use switchbot_mqtt::mqtt::{BrokerError, InboundMessage};
use switchbot_mqtt::settings::{CallbackSettings, DevicePasswords};
use tokio::sync::oneshot;

fn dispatcher(broker: &MockBroker, log: &EventLog) -> Dispatcher {
    let settings = CallbackSettings::new(3, DevicePasswords::default(), false, "").unwrap();
    let devices = MockDeviceLibrary::new(log.clone());
    let ctx = DispatchContext::new(settings, Arc::new(broker.clone()), Arc::new(devices));
    Dispatcher::new(Arc::new(broker.clone()), ctx, default_registry())
}

#[tokio::test]
async fn ending_streams_are_terminal() {
    let log = EventLog::default();
    let broker = MockBroker::new(log.clone());
    let (_connection_alive, connection) = oneshot::channel::<Result<(), BrokerError>>();

    let bridge = tokio::spawn(serve(dispatcher(&broker, &log), async move {
        connection.await.unwrap_or(Err(BrokerError::Closed))
    }));
    broker.wait_for_subscriptions(2).await;
    broker.close();

    let result = bridge.await.unwrap();
    assert!(matches!(result, Err(BridgeError::StreamsEnded)), "{result:?}");
}

#[tokio::test]
async fn clean_disconnect_stops_the_bridge() {
    let log = EventLog::default();
    let broker = MockBroker::new(log.clone());
    let (disconnect, connection) = oneshot::channel::<Result<(), BrokerError>>();

    let bridge = tokio::spawn(serve(dispatcher(&broker, &log), async move {
        connection.await.unwrap_or(Err(BrokerError::Closed))
    }));
    broker.wait_for_subscriptions(2).await;
    disconnect.send(Ok(())).unwrap();

    assert!(bridge.await.unwrap().is_ok());
}

#[tokio::test]
async fn lost_connection_is_an_error() {
    let log = EventLog::default();
    let broker = MockBroker::new(log.clone());
    let (lost, connection) = oneshot::channel::<Result<(), BrokerError>>();

    let bridge = tokio::spawn(serve(dispatcher(&broker, &log), async move {
        connection.await.unwrap_or(Err(BrokerError::Closed))
    }));
    broker.wait_for_subscriptions(2).await;
    broker.deliver(InboundMessage::new("switchbot/aa:bb:cc:dd:ee:ff/press", ""));
    lost.send(Err(BrokerError::Connection("reset by peer".into())))
        .unwrap();

    let result = bridge.await.unwrap();
    assert!(
        matches!(result, Err(BridgeError::Broker(BrokerError::Connection(_)))),
        "{result:?}"
    );
}
