//! # Device Library Capability Set
//!
//! The bridge never talks Bluetooth itself. It drives actuators through the
//! traits in this module, which a device library implements:
//!
//! - [`DeviceLibrary`] opens a session for one [`DeviceIdentity`].
//! - [`SwitchbotDevice`] is what every family offers (refresh, battery, release).
//! - [`BotDevice`] and [`CurtainDevice`] add the family-specific commands.
//!
//! Operations take `&self`; implementations keep their cached state behind
//! interior mutability so a device handle can be shared by retry closures.
//!
//! With the `bluetooth` feature, [`bluetooth::BluetoothLibrary`] provides a
//! btleplug-backed implementation.

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
mod retry;

pub use retry::with_retries;

use async_trait::async_trait;
use thiserror::Error;

use crate::topic::DeviceIdentity;

/// Failures reported by a device library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// No response within the library's deadline.
    #[error("device operation timed out")]
    Timeout,

    /// The wireless link failed; a new attempt may succeed.
    #[error("bluetooth transport error: {0}")]
    Transport(String),

    /// No device with this address is in range.
    #[error("device {0} not found")]
    NotFound(String),

    /// The device answered with a failure status.
    #[error("device rejected command (status {0:#04x})")]
    Rejected(u8),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no bluetooth adapter available")]
    NoAdapter,
}

impl DeviceError {
    /// Whether the operation is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout | DeviceError::Transport(_))
    }
}

/// Everything a library needs to open a device session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub identity: DeviceIdentity,
    pub password: Option<String>,
    pub retry_count: u32,
}

/// Capabilities shared by all SwitchBot families.
#[async_trait]
pub trait SwitchbotDevice: Send + Sync {
    /// Refreshes cached device state (battery, position, ...).
    async fn update(&self) -> Result<(), DeviceError>;

    /// Last known battery level in percent.
    fn battery_percent(&self) -> Option<u8>;

    /// Releases the underlying connection.
    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// SwitchBot Bot ("button" automator).
#[async_trait]
pub trait BotDevice: SwitchbotDevice {
    async fn press(&self) -> Result<(), DeviceError>;
    async fn turn_on(&self) -> Result<(), DeviceError>;
    async fn turn_off(&self) -> Result<(), DeviceError>;
}

/// SwitchBot Curtain. Positions are percentages with 100 = fully open.
#[async_trait]
pub trait CurtainDevice: SwitchbotDevice {
    async fn open(&self) -> Result<(), DeviceError>;
    async fn close(&self) -> Result<(), DeviceError>;
    async fn stop(&self) -> Result<(), DeviceError>;
    async fn set_position(&self, percent: u8) -> Result<(), DeviceError>;

    /// Cached position, refreshed by [`SwitchbotDevice::update`].
    fn position(&self) -> Option<u8>;
}

/// Opens device sessions. One call per inbound message; handles are never pooled.
#[async_trait]
pub trait DeviceLibrary: Send + Sync {
    async fn connect_bot(&self, params: &ConnectParams) -> Result<Box<dyn BotDevice>, DeviceError>;

    async fn connect_curtain(
        &self,
        params: &ConnectParams,
    ) -> Result<Box<dyn CurtainDevice>, DeviceError>;
}
