//! btleplug-backed [`DeviceLibrary`].
//!
//! Devices are located by scanning for their address. Commands are written
//! to the SwitchBot GATT service and confirmed through its notify
//! characteristic; battery level and curtain position are read from the
//! advertisement service data.
//!
//! Positions are exposed with 100 = fully open. The curtain itself counts
//! the other way round, so positions are mirrored on the wire.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BotDevice, ConnectParams, CurtainDevice, DeviceError, DeviceLibrary, SwitchbotDevice};

const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0xcba20002_224d_11e6_9fb8_0002a5d5c51b);
const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0xcba20003_224d_11e6_9fb8_0002a5d5c51b);
const SERVICE_DATA_UUIDS: [Uuid; 2] = [
    Uuid::from_u128(0x0000fd3d_0000_1000_8000_00805f9b34fb),
    Uuid::from_u128(0x00000d00_0000_1000_8000_00805f9b34fb),
];

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const BOT_PRESS: [u8; 3] = [0x57, 0x01, 0x00];
const BOT_TURN_ON: [u8; 3] = [0x57, 0x01, 0x01];
const BOT_TURN_OFF: [u8; 3] = [0x57, 0x01, 0x02];
const CURTAIN_POSITION_PREFIX: [u8; 6] = [0x57, 0x0f, 0x45, 0x01, 0x05, 0xff];
const CURTAIN_STOP: [u8; 5] = [0x57, 0x0f, 0x45, 0x00, 0x01];

impl From<btleplug::Error> for DeviceError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => DeviceError::NotFound("peripheral".into()),
            btleplug::Error::TimedOut(_) => DeviceError::Timeout,
            btleplug::Error::NotSupported(what) => DeviceError::Unsupported(what),
            other => DeviceError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Bot,
    Curtain,
}

impl Family {
    fn accepts(self, status: u8) -> bool {
        match self {
            Family::Bot => matches!(status, 0x01 | 0x05),
            Family::Curtain => status == 0x01,
        }
    }
}

/// Adds the password checksum to a command key.
///
/// `57 0F ...` becomes `57 1F <crc32(password) BE> ...`.
fn encode_command(key: &[u8], password: Option<&str>) -> Vec<u8> {
    let Some(password) = password else {
        return key.to_vec();
    };
    let mut encoded = Vec::with_capacity(key.len() + 4);
    encoded.push(key[0]);
    encoded.push(0x10 | (key[1] & 0x0f));
    encoded.extend_from_slice(&crc32fast::hash(password.as_bytes()).to_be_bytes());
    encoded.extend_from_slice(&key[2..]);
    encoded
}

fn curtain_position_command(percent: u8) -> Vec<u8> {
    let mut key = CURTAIN_POSITION_PREFIX.to_vec();
    key.push(100 - percent.min(100));
    key
}

/// Battery and (for curtains) position from advertisement service data.
fn parse_service_data(data: &[u8]) -> (Option<u8>, Option<u8>) {
    let battery = data.get(2).map(|byte| byte & 0x7f);
    let position = data.get(3).map(|byte| 100 - (byte & 0x7f).min(100));
    (battery, position)
}

pub struct BluetoothLibrary {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BluetoothLibrary {
    /// Opens the first adapter and starts a passive scan.
    pub async fn new(scan_timeout: Duration) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!(scan_timeout = ?scan_timeout, "Bluetooth adapter ready");
        Ok(Self {
            adapter,
            scan_timeout,
        })
    }

    async fn find(&self, params: &ConnectParams) -> Result<Peripheral, DeviceError> {
        let wanted = params.identity.canonical();
        let search = async {
            loop {
                for peripheral in self.adapter.peripherals().await? {
                    if peripheral.address().to_string().eq_ignore_ascii_case(wanted) {
                        return Ok::<_, DeviceError>(peripheral);
                    }
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(self.scan_timeout, search)
            .await
            .map_err(|_| DeviceError::NotFound(wanted.to_string()))?
    }

    async fn open(&self, family: Family, params: &ConnectParams) -> Result<BluetoothDevice, DeviceError> {
        let peripheral = self.find(params).await?;
        debug!(mac = %params.identity, ?family, "Found device");
        Ok(BluetoothDevice {
            peripheral,
            family,
            password: params.password.clone(),
            battery: Mutex::new(None),
            position: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DeviceLibrary for BluetoothLibrary {
    async fn connect_bot(&self, params: &ConnectParams) -> Result<Box<dyn BotDevice>, DeviceError> {
        Ok(Box::new(self.open(Family::Bot, params).await?))
    }

    async fn connect_curtain(
        &self,
        params: &ConnectParams,
    ) -> Result<Box<dyn CurtainDevice>, DeviceError> {
        Ok(Box::new(self.open(Family::Curtain, params).await?))
    }
}

struct BluetoothDevice {
    peripheral: Peripheral,
    family: Family,
    password: Option<String>,
    battery: Mutex<Option<u8>>,
    position: Mutex<Option<u8>>,
}

impl BluetoothDevice {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, DeviceError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| DeviceError::Unsupported(format!("missing characteristic {uuid}")))
    }

    /// Writes `key` and waits for the status notification.
    async fn send(&self, key: &[u8]) -> Result<(), DeviceError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
            self.peripheral.discover_services().await?;
        }
        let write = self.characteristic(WRITE_CHARACTERISTIC)?;
        let notify = self.characteristic(NOTIFY_CHARACTERISTIC)?;
        self.peripheral.subscribe(&notify).await?;
        let mut notifications = self.peripheral.notifications().await?;

        let command = encode_command(key, self.password.as_deref());
        self.peripheral
            .write(&write, &command, WriteType::WithResponse)
            .await?;

        let reply = tokio::time::timeout(REPLY_TIMEOUT, async {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == NOTIFY_CHARACTERISTIC {
                    return Some(notification.value);
                }
            }
            None
        })
        .await
        .map_err(|_| DeviceError::Timeout)?
        .ok_or_else(|| DeviceError::Transport("notification stream closed".into()))?;

        match reply.first() {
            Some(&status) if self.family.accepts(status) => Ok(()),
            Some(&status) => Err(DeviceError::Rejected(status)),
            None => Err(DeviceError::Transport("empty reply".into())),
        }
    }
}

#[async_trait]
impl SwitchbotDevice for BluetoothDevice {
    async fn update(&self) -> Result<(), DeviceError> {
        let properties = self
            .peripheral
            .properties()
            .await?
            .ok_or_else(|| DeviceError::Transport("no advertisement received".into()))?;
        let data = SERVICE_DATA_UUIDS
            .iter()
            .find_map(|uuid| properties.service_data.get(uuid))
            .ok_or_else(|| DeviceError::Transport("no service data advertised".into()))?;

        let (battery, position) = parse_service_data(data);
        *self.battery.lock().unwrap_or_else(PoisonError::into_inner) = battery;
        if self.family == Family::Curtain {
            *self.position.lock().unwrap_or_else(PoisonError::into_inner) = position;
        }
        Ok(())
    }

    fn battery_percent(&self) -> Option<u8> {
        *self.battery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BotDevice for BluetoothDevice {
    async fn press(&self) -> Result<(), DeviceError> {
        self.send(&BOT_PRESS).await
    }

    async fn turn_on(&self) -> Result<(), DeviceError> {
        self.send(&BOT_TURN_ON).await
    }

    async fn turn_off(&self) -> Result<(), DeviceError> {
        self.send(&BOT_TURN_OFF).await
    }
}

#[async_trait]
impl CurtainDevice for BluetoothDevice {
    async fn open(&self) -> Result<(), DeviceError> {
        self.send(&curtain_position_command(100)).await
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.send(&curtain_position_command(0)).await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.send(&CURTAIN_STOP).await
    }

    async fn set_position(&self, percent: u8) -> Result<(), DeviceError> {
        self.send(&curtain_position_command(percent)).await
    }

    fn position(&self) -> Option<u8> {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
