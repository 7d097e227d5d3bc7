//! # Actor Contract
//!
//! This module defines the contract every device family implements and the
//! dispatch logic written *once* against it.
//!
//! ## Key Types
//!
//! - [`Actor`]: the trait Button and Curtain implement. Topic templates are
//!   associated constants, so each type carries its own topic set.
//! - [`DispatchContext`]: the explicit, immutable context handed to every
//!   callback (settings, publisher, device library, per-device locks).
//! - [`ActorError`]: everything that can go wrong while handling one message.
//!
//! ## Message Lifecycle
//!
//! ```text
//! InboundMessage
//!   -> retained? drop
//!   -> parse topic against template      (TopicMismatch: warn + drop)
//!   -> validate MAC                      (InvalidDeviceIdentity: warn + drop)
//!   -> lock device, construct actor, connect   (DeviceConnectError: error + drop)
//!   -> execute command / refresh device info
//!   -> publish retained state
//!   -> release device, unlock
//! ```
//!
//! Per-message errors never escape the callbacks; the stream keeps running.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::device::{with_retries, DeviceError, DeviceLibrary, SwitchbotDevice};
use crate::mqtt::{InboundMessage, Publisher};
use crate::settings::CallbackSettings;
use crate::topic::{
    join_topic, parse_topic, DeviceIdentity, InvalidDeviceIdentity, Placeholder, TopicMismatch,
    TopicTemplate,
};

// =============================================================================
// 1. ERRORS
// =============================================================================

/// Errors raised while handling a single message.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    TopicMismatch(#[from] TopicMismatch),

    #[error(transparent)]
    InvalidDeviceIdentity(#[from] InvalidDeviceIdentity),

    #[error("failed to connect to {identity}: {source}")]
    DeviceConnect {
        identity: DeviceIdentity,
        #[source]
        source: DeviceError,
    },

    #[error("{operation} failed on {identity}: {source}")]
    DeviceOperation {
        identity: DeviceIdentity,
        operation: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("{0} is not connected")]
    NotConnected(DeviceIdentity),

    #[error(transparent)]
    Curtain(#[from] crate::curtain_actor::CurtainError),
}

// =============================================================================
// 2. THE ABSTRACTION
// =============================================================================

/// Device families the bridge can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Button,
    Curtain,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKind::Button => f.write_str("button"),
            ActorKind::Curtain => f.write_str("curtain"),
        }
    }
}

/// The contract one device family satisfies.
///
/// # Architecture Note
/// An actor instance is ephemeral: one per inbound message, bound to one
/// [`DeviceIdentity`]. It is constructed by [`init_from_topic`], connected
/// once, used for a single command or refresh and then dropped. Nothing is
/// cached between messages.
///
/// # Provided Methods
/// Battery reporting, state reporting and the generic device-info refresh
/// are implemented here against [`Actor::device`]. Families only override
/// them to report more (the curtain also reports its position).
#[async_trait]
pub trait Actor: Sized + Send + Sync + 'static {
    const KIND: ActorKind;
    const COMMAND_TOPIC: TopicTemplate;
    const REQUEST_DEVICE_INFO_TOPIC: TopicTemplate;
    const STATE_TOPIC: TopicTemplate;
    const BATTERY_PERCENTAGE_TOPIC: TopicTemplate;

    /// The family-specific handle from the device library.
    type Device: SwitchbotDevice + ?Sized;

    /// A decoded command payload.
    type Command: Send + Sync + fmt::Debug;

    fn new(identity: DeviceIdentity, retry_count: u32, password: Option<String>) -> Self;

    fn identity(&self) -> &DeviceIdentity;

    fn retry_count(&self) -> u32;

    /// Decodes a command payload. Called before any device I/O.
    fn decode_command(payload: &[u8]) -> Result<Self::Command, ActorError>;

    /// Opens the device session.
    async fn connect(&mut self, devices: &dyn DeviceLibrary) -> Result<(), ActorError>;

    /// The connected device handle.
    fn device(&self) -> Result<&Self::Device, ActorError>;

    /// Performs the command and publishes the resulting state, retained.
    ///
    /// With `update_device_info`, battery (and family extras) are refreshed
    /// afterwards on a best-effort basis.
    async fn execute_command(
        &self,
        payload: &[u8],
        publisher: &dyn Publisher,
        update_device_info: bool,
        topic_prefix: &str,
    ) -> Result<(), ActorError>;

    /// Refreshes cached device state, retrying transient failures.
    async fn update_device_info(&self) -> Result<(), ActorError> {
        let device = self.device()?;
        with_retries(self.retry_count(), "update", || device.update())
            .await
            .map_err(|source| ActorError::DeviceOperation {
                identity: self.identity().clone(),
                operation: "update",
                source,
            })
    }

    /// Publishes the last known battery level as a decimal string.
    async fn report_battery(&self, publisher: &dyn Publisher, topic_prefix: &str) {
        let battery = match self.device() {
            Ok(device) => device.battery_percent(),
            Err(err) => {
                warn!(mac = %self.identity(), error = %err, "Cannot report battery");
                return;
            }
        };
        match battery {
            Some(percent) => {
                self.publish(
                    Self::BATTERY_PERCENTAGE_TOPIC,
                    percent.to_string().into_bytes(),
                    publisher,
                    topic_prefix,
                )
                .await;
            }
            None => warn!(mac = %self.identity(), "Battery level unknown, not reporting"),
        }
    }

    async fn update_and_report_device_info(
        &self,
        publisher: &dyn Publisher,
        topic_prefix: &str,
    ) -> Result<(), ActorError> {
        self.update_device_info().await?;
        self.report_battery(publisher, topic_prefix).await;
        Ok(())
    }

    async fn report_state(&self, state: &[u8], publisher: &dyn Publisher, topic_prefix: &str) {
        self.publish(Self::STATE_TOPIC, state.to_vec(), publisher, topic_prefix)
            .await;
    }

    /// Publishes to this actor's instance of `template`, retained.
    ///
    /// Broker failures are logged; the state is simply not updated this cycle.
    async fn publish(
        &self,
        template: TopicTemplate,
        payload: Vec<u8>,
        publisher: &dyn Publisher,
        topic_prefix: &str,
    ) {
        let topic = join_topic(topic_prefix, template, self.identity().as_str());
        debug!(%topic, payload = ?String::from_utf8_lossy(&payload), "Publishing");
        if let Err(err) = publisher.publish(topic.clone(), payload, true).await {
            error!(%topic, error = %err, "Failed to publish MQTT message");
        }
    }

    /// Releases the device handle.
    async fn release(&self) {
        if let Ok(device) = self.device() {
            if let Err(err) = device.disconnect().await {
                warn!(mac = %self.identity(), error = %err, "Failed to release device");
            }
        }
    }
}

/// Runs [`Actor::update_and_report_device_info`] after a successful
/// command. Failures are logged and do not fail the command.
pub async fn refresh_after_command<A: Actor>(actor: &A, publisher: &dyn Publisher, topic_prefix: &str) {
    if let Err(err) = actor.update_and_report_device_info(publisher, topic_prefix).await {
        warn!(kind = %A::KIND, mac = %actor.identity(), error = %err, "Device info refresh failed");
    }
}

// =============================================================================
// 3. CONTEXT
// =============================================================================

/// Keyed async mutex serializing device sessions by canonical MAC.
///
/// Streams of different actor kinds run concurrently; this keeps two of
/// them from opening sessions against the same actuator at once.
#[derive(Clone, Default)]
pub struct DeviceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeviceLocks {
    pub async fn acquire(&self, identity: &DeviceIdentity) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(identity.canonical().to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Everything a callback needs, passed explicitly. Cheap to clone.
#[derive(Clone)]
pub struct DispatchContext {
    settings: Arc<CallbackSettings>,
    publisher: Arc<dyn Publisher>,
    devices: Arc<dyn DeviceLibrary>,
    locks: DeviceLocks,
}

impl DispatchContext {
    pub fn new(
        settings: CallbackSettings,
        publisher: Arc<dyn Publisher>,
        devices: Arc<dyn DeviceLibrary>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            publisher,
            devices,
            locks: DeviceLocks::default(),
        }
    }

    pub fn settings(&self) -> &CallbackSettings {
        &self.settings
    }

    pub fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    pub fn devices(&self) -> &dyn DeviceLibrary {
        self.devices.as_ref()
    }
}

// =============================================================================
// 4. SHARED DISPATCH LOGIC
// =============================================================================

/// A connected actor holding its device lock until dropped.
pub struct Session<A> {
    actor: A,
    _guard: OwnedMutexGuard<()>,
}

impl<A> Deref for Session<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.actor
    }
}

fn resolve_identity(topic: &str, expected: TopicTemplate, settings: &CallbackSettings) -> Option<DeviceIdentity> {
    let mut values = match parse_topic(topic, settings.topic_prefix(), expected) {
        Ok(values) => values,
        Err(err) => {
            warn!(error = %err, "Ignoring message");
            return None;
        }
    };
    let mac = values.remove(&Placeholder::MacAddress)?;
    match DeviceIdentity::parse(&mac) {
        Ok(identity) => Some(identity),
        Err(err) => {
            warn!(error = %err, "Ignoring message");
            None
        }
    }
}

/// Parses `topic`, validates the MAC, then constructs and connects an actor.
///
/// Returns `Ok(None)` (after logging) when the topic does not match
/// `expected` or carries an invalid MAC; no device I/O happens then.
/// Connect failures are returned to the caller.
pub async fn init_from_topic<A: Actor>(
    topic: &str,
    expected: TopicTemplate,
    ctx: &DispatchContext,
) -> Result<Option<Session<A>>, ActorError> {
    let Some(identity) = resolve_identity(topic, expected, ctx.settings()) else {
        return Ok(None);
    };

    let guard = ctx.locks.acquire(&identity).await;
    let password = ctx.settings().device_password(&identity).map(str::to_string);
    let mut actor = A::new(identity, ctx.settings().retry_count(), password);
    actor.connect(ctx.devices()).await?;

    Ok(Some(Session {
        actor,
        _guard: guard,
    }))
}

async fn open_session<A: Actor>(
    message: &InboundMessage,
    expected: TopicTemplate,
    ctx: &DispatchContext,
) -> Option<Session<A>> {
    match init_from_topic::<A>(&message.topic, expected, ctx).await {
        Ok(session) => session,
        Err(err) => {
            error!(kind = %A::KIND, topic = %message.topic, error = %err, "Dropping message");
            None
        }
    }
}

fn log_received(message: &InboundMessage) -> bool {
    debug!(
        topic = %message.topic,
        payload = ?String::from_utf8_lossy(&message.payload),
        "Received message"
    );
    if message.retain {
        info!(topic = %message.topic, "Ignoring retained message");
        return false;
    }
    true
}

/// Handles one message on an actor's command topic.
pub async fn command_callback<A: Actor>(ctx: &DispatchContext, message: InboundMessage) {
    if !log_received(&message) {
        return;
    }
    if let Err(err) = A::decode_command(&message.payload) {
        warn!(kind = %A::KIND, topic = %message.topic, error = %err, "Ignoring message");
        return;
    }
    let Some(session) = open_session::<A>(&message, A::COMMAND_TOPIC, ctx).await else {
        return;
    };

    let settings = ctx.settings();
    if let Err(err) = session
        .execute_command(
            &message.payload,
            ctx.publisher(),
            settings.fetch_device_info(),
            settings.topic_prefix(),
        )
        .await
    {
        error!(kind = %A::KIND, mac = %session.identity(), error = %err, "Command failed");
    }
    session.release().await;
}

/// Handles one message on an actor's request-device-info topic.
pub async fn device_info_update_callback<A: Actor>(ctx: &DispatchContext, message: InboundMessage) {
    if !log_received(&message) {
        return;
    }
    let Some(session) = open_session::<A>(&message, A::REQUEST_DEVICE_INFO_TOPIC, ctx).await else {
        return;
    };

    if let Err(err) = session
        .update_and_report_device_info(ctx.publisher(), ctx.settings().topic_prefix())
        .await
    {
        error!(kind = %A::KIND, mac = %session.identity(), error = %err, "Device info update failed");
    }
    session.release().await;
}
