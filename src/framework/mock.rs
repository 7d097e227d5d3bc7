//! # Mock Framework
//!
//! In-memory stand-ins for the two external systems, so dispatch can be
//! tested without a broker or a Bluetooth adapter.
//!
//! - [`MockBroker`]: records subscriptions and publishes, and lets a test
//!   [`deliver`](MockBroker::deliver) inbound messages.
//! - [`MockDeviceLibrary`]: hands out scripted devices. Every connect,
//!   device operation and release is recorded.
//!
//! Both write to one shared [`EventLog`], which gives tests a single ordered
//! view of what happened across the wire and the radio.
//!
//! # Example
//! ```ignore
//! let log = EventLog::default();
//! let broker = MockBroker::new(log.clone());
//! let devices = MockDeviceLibrary::new(log.clone());
//! devices.script("aa:bb:cc:dd:ee:ff", "press", [Err(DeviceError::Timeout), Ok(())]);
//!
//! // ... spawn a Dispatcher over `broker` and `devices` ...
//! broker.wait_for_subscriptions(2).await;
//! broker.deliver(InboundMessage::new("switchbot/aa:bb:cc:dd:ee:ff/press", "ON"));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::device::{BotDevice, ConnectParams, CurtainDevice, DeviceError, DeviceLibrary, SwitchbotDevice};
use crate::mqtt::{Broker, BrokerError, InboundMessage, MessageStream, Publisher};
use crate::topic::filter_matches;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// EVENT LOG
// =============================================================================

/// Something observable the bridge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A device session was opened (or attempted). `family` is `bot` or `curtain`.
    Connect {
        family: &'static str,
        mac: String,
        password: Option<String>,
    },
    /// One attempt of a device operation, e.g. `press` or `set_position(42)`.
    Operation { mac: String, operation: String },
    Published {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnect { mac: String },
}

/// Shared, ordered record of [`MockEvent`]s. MACs are canonical.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<MockEvent>>>);

impl EventLog {
    pub fn push(&self, event: MockEvent) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.0).clone()
    }

    pub fn connects(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, MockEvent::Connect { .. }))
            .count()
    }

    /// Operation attempts in order, e.g. `["update", "press"]`.
    pub fn operations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Operation { operation, .. } => Some(operation),
                _ => None,
            })
            .collect()
    }

    /// Published `(topic, payload)` pairs with payloads decoded as UTF-8.
    pub fn published(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Published { topic, payload, .. } => {
                    Some((topic, String::from_utf8_lossy(&payload).into_owned()))
                }
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// BROKER
// =============================================================================

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<Vec<(String, Option<mpsc::UnboundedSender<InboundMessage>>)>>,
    subscribed: Notify,
    fail_publishes: AtomicBool,
}

/// In-memory [`Broker`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockBroker {
    log: EventLog,
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            state: Arc::default(),
        }
    }

    /// Filters subscribed so far, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state.subscriptions)
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Waits until at least `count` subscriptions exist.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        loop {
            let notified = self.state.subscribed.notified();
            if lock(&self.state.subscriptions).len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Sends `message` to every open stream whose filter matches.
    /// Returns the number of streams reached.
    pub fn deliver(&self, message: InboundMessage) -> usize {
        lock(&self.state.subscriptions)
            .iter()
            .filter(|(filter, _)| filter_matches(filter, &message.topic))
            .filter_map(|(_, sender)| sender.as_ref())
            .filter(|sender| sender.send(message.clone()).is_ok())
            .count()
    }

    /// Ends every stream, as a lost connection would.
    pub fn close(&self) {
        for (_, sender) in lock(&self.state.subscriptions).iter_mut() {
            sender.take();
        }
    }

    /// Makes every subsequent publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for MockBroker {
    async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        if self.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                topic,
                reason: "mock publish failure".into(),
            });
        }
        self.log.push(MockEvent::Published {
            topic,
            payload,
            retain,
        });
        Ok(())
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn subscribe(&self, filter: &str) -> Result<MessageStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state.subscriptions).push((filter.to_string(), Some(sender)));
        self.state.subscribed.notify_waiters();
        Ok(receiver)
    }
}

// =============================================================================
// DEVICE LIBRARY
// =============================================================================

#[derive(Default)]
struct LibraryState {
    connect_failures: HashMap<String, DeviceError>,
    scripts: HashMap<(String, String), VecDeque<Result<(), DeviceError>>>,
    battery: HashMap<String, u8>,
    position: HashMap<String, u8>,
    operation_delay: Duration,
}

/// Scriptable [`DeviceLibrary`]. MAC arguments must be canonical.
///
/// Unscripted operations succeed. Devices report battery and position only
/// after a successful `update`, from the values set here.
#[derive(Clone)]
pub struct MockDeviceLibrary {
    log: EventLog,
    state: Arc<Mutex<LibraryState>>,
}

impl MockDeviceLibrary {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            state: Arc::default(),
        }
    }

    /// Every connect to `mac` fails with `error`.
    pub fn fail_connect(&self, mac: &str, error: DeviceError) {
        lock(&self.state).connect_failures.insert(mac.to_string(), error);
    }

    /// Queues results for successive attempts of `operation` on `mac`.
    /// `operation` is the bare name, e.g. `set_position`.
    pub fn script(
        &self,
        mac: &str,
        operation: &str,
        results: impl IntoIterator<Item = Result<(), DeviceError>>,
    ) {
        lock(&self.state)
            .scripts
            .entry((mac.to_string(), operation.to_string()))
            .or_default()
            .extend(results);
    }

    pub fn set_battery(&self, mac: &str, percent: u8) {
        lock(&self.state).battery.insert(mac.to_string(), percent);
    }

    pub fn set_position(&self, mac: &str, percent: u8) {
        lock(&self.state).position.insert(mac.to_string(), percent);
    }

    /// Makes each operation attempt take `delay`.
    pub fn set_operation_delay(&self, delay: Duration) {
        lock(&self.state).operation_delay = delay;
    }

    fn open(&self, family: &'static str, params: &ConnectParams) -> Result<MockDevice, DeviceError> {
        let mac = params.identity.canonical().to_string();
        self.log.push(MockEvent::Connect {
            family,
            mac: mac.clone(),
            password: params.password.clone(),
        });
        if let Some(error) = lock(&self.state).connect_failures.get(&mac) {
            return Err(error.clone());
        }
        Ok(MockDevice {
            mac,
            log: self.log.clone(),
            state: self.state.clone(),
            battery: Mutex::new(None),
            position: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DeviceLibrary for MockDeviceLibrary {
    async fn connect_bot(&self, params: &ConnectParams) -> Result<Box<dyn BotDevice>, DeviceError> {
        Ok(Box::new(self.open("bot", params)?))
    }

    async fn connect_curtain(
        &self,
        params: &ConnectParams,
    ) -> Result<Box<dyn CurtainDevice>, DeviceError> {
        Ok(Box::new(self.open("curtain", params)?))
    }
}

/// Device handed out by [`MockDeviceLibrary`]; acts as bot and curtain.
pub struct MockDevice {
    mac: String,
    log: EventLog,
    state: Arc<Mutex<LibraryState>>,
    battery: Mutex<Option<u8>>,
    position: Mutex<Option<u8>>,
}

impl MockDevice {
    async fn attempt(&self, name: &str, operation: String) -> Result<(), DeviceError> {
        self.log.push(MockEvent::Operation {
            mac: self.mac.clone(),
            operation,
        });
        let (delay, result) = {
            let mut state = lock(&self.state);
            let result = state
                .scripts
                .get_mut(&(self.mac.clone(), name.to_string()))
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(()));
            (state.operation_delay, result)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl SwitchbotDevice for MockDevice {
    async fn update(&self) -> Result<(), DeviceError> {
        self.attempt("update", "update".into()).await?;
        let (battery, position) = {
            let state = lock(&self.state);
            (
                state.battery.get(&self.mac).copied(),
                state.position.get(&self.mac).copied(),
            )
        };
        *lock(&self.battery) = battery;
        *lock(&self.position) = position;
        Ok(())
    }

    fn battery_percent(&self) -> Option<u8> {
        *lock(&self.battery)
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.log.push(MockEvent::Disconnect {
            mac: self.mac.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl BotDevice for MockDevice {
    async fn press(&self) -> Result<(), DeviceError> {
        self.attempt("press", "press".into()).await
    }

    async fn turn_on(&self) -> Result<(), DeviceError> {
        self.attempt("turn_on", "turn_on".into()).await
    }

    async fn turn_off(&self) -> Result<(), DeviceError> {
        self.attempt("turn_off", "turn_off".into()).await
    }
}

#[async_trait]
impl CurtainDevice for MockDevice {
    async fn open(&self) -> Result<(), DeviceError> {
        self.attempt("open", "open".into()).await
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.attempt("close", "close".into()).await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.attempt("stop", "stop".into()).await
    }

    async fn set_position(&self, percent: u8) -> Result<(), DeviceError> {
        self.attempt("set_position", format!("set_position({percent})"))
            .await
    }

    fn position(&self) -> Option<u8> {
        *lock(&self.position)
    }
}
