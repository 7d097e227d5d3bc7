//! # switchbot-mqtt
//!
//! > **MQTT bridge for SwitchBot button automators and curtain motors.**
//!
//! Home-automation hubs publish commands on well-known MQTT topics; this
//! crate turns them into Bluetooth Low-Energy operations and publishes the
//! resulting state and battery level back, retained.
//!
//! ```text
//! homeassistant/switchbot/aa:bb:cc:dd:ee:ff/press         -> bot press
//! homeassistant/switchbot/aa:bb:cc:dd:ee:ff/set-position  -> curtain seek
//! homeassistant/switchbot/aa:bb:cc:dd:ee:ff/state         <- retained state
//! ```
//!
//! ## Core Concepts
//!
//! ### One contract, written once
//! Every device family implements [`Actor`](framework::Actor). Its topic
//! templates are associated constants, and the whole per-message lifecycle
//! (retained-message guard, topic parsing, MAC validation, connect,
//! execute, report, release) lives in [`framework`], generic over the actor.
//!
//! ### One actor per message
//! Actors are never cached. Each inbound message gets a fresh actor and a
//! fresh device session, which is released when the message is done.
//!
//! ### Ordering
//! Each subscription is consumed sequentially in its own task. Sessions
//! against one device are serialized across subscriptions by a keyed
//! lock, so two streams never race a BLE session to the same actuator.
//!
//! ### Errors stay per message
//! Malformed topics, invalid MACs, unexpected payloads and device failures
//! are logged and drop the message; the stream keeps running. Only startup
//! configuration and the broker connection are fatal.
//!
//! ## Module Tour
//!
//! - [`topic`]: topic templates, join/parse, MAC validation.
//! - [`settings`]: immutable callback settings and password files.
//! - [`device`]: device library traits, retry policy, optional btleplug backend.
//! - [`mqtt`]: broker traits and the rumqttc connection.
//! - [`framework`]: actor contract, dispatch engine, mocks.
//! - [`button_actor`], [`curtain_actor`]: the two device families.
//! - [`lifecycle`]: run loop and tracing setup.
//!
//! ## Running
//!
//! ```bash
//! cargo run --features bluetooth -- --mqtt-host localhost --mqtt-disable-tls --fetch-device-info
//! ```

pub mod button_actor;
pub mod curtain_actor;
pub mod device;
pub mod framework;
pub mod lifecycle;
pub mod mqtt;
pub mod settings;
pub mod topic;
