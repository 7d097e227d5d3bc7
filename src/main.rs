//! switchbot-mqtt - MQTT client controlling SwitchBot button & curtain automators.
//!
//! Compatible with home-assistant.io's MQTT Switch & Cover platforms.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use switchbot_mqtt::device::{DeviceError, DeviceLibrary};
use switchbot_mqtt::lifecycle::tracing::setup_tracing;
use switchbot_mqtt::lifecycle::{Bridge, BridgeConfig, BridgeError};
use switchbot_mqtt::mqtt::MqttConfig;
use switchbot_mqtt::settings::{read_password_file, CallbackSettings, DevicePasswords};

const MQTT_DEFAULT_PORT: u16 = 1883;
const MQTT_DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "MQTT client controlling SwitchBot button automators and curtain motors"
)]
struct Args {
    /// MQTT broker host name or address.
    #[arg(long, env = "MQTT_HOST")]
    mqtt_host: String,

    /// Defaults to 8883, or 1883 with --mqtt-disable-tls.
    #[arg(long, env = "MQTT_PORT")]
    mqtt_port: Option<u16>,

    #[arg(long, env = "MQTT_DISABLE_TLS")]
    mqtt_disable_tls: bool,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", conflicts_with = "mqtt_password_file")]
    mqtt_password: Option<String>,

    /// Read the MQTT password from the first line of this file.
    #[arg(long, env = "MQTT_PASSWORD_FILE")]
    mqtt_password_file: Option<PathBuf>,

    /// Raw prefix prepended to every topic.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "homeassistant/")]
    mqtt_topic_prefix: String,

    /// Maximum number of attempts for each device operation.
    #[arg(long = "retries", env = "SWITCHBOT_RETRIES", default_value_t = 3)]
    retry_count: u32,

    /// Path to JSON file mapping MAC addresses of switchbot devices to passwords, e.g.
    /// {"11:22:33:44:55:66": "password", "aa:bb:cc:dd:ee:ff": "secret"}
    #[arg(long, env = "SWITCHBOT_DEVICE_PASSWORD_FILE")]
    device_password_file: Option<PathBuf>,

    /// Report devices' battery level on topic "[prefix]switchbot/MAC_ADDRESS/battery-percentage"
    /// after every command. Additionally request updates on topic
    /// "[prefix]switchbot/MAC_ADDRESS/request-device-info".
    #[arg(long, env = "SWITCHBOT_FETCH_DEVICE_INFO")]
    fetch_device_info: bool,

    /// How long to scan for a device before giving up.
    #[arg(long, env = "SWITCHBOT_SCAN_TIMEOUT_SECONDS", default_value_t = 10)]
    scan_timeout_seconds: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn bridge_config(&self) -> Result<BridgeConfig, BridgeError> {
        let password = match &self.mqtt_password_file {
            Some(path) => Some(read_password_file(path)?),
            None => self.mqtt_password.clone(),
        };
        let port = self.mqtt_port.unwrap_or(if self.mqtt_disable_tls {
            MQTT_DEFAULT_PORT
        } else {
            MQTT_DEFAULT_TLS_PORT
        });
        let mqtt = MqttConfig {
            host: self.mqtt_host.clone(),
            port,
            username: self.mqtt_username.clone(),
            password,
            tls: !self.mqtt_disable_tls,
            client_id: format!("switchbot-mqtt-{}", std::process::id()),
        };

        let device_passwords = match &self.device_password_file {
            Some(path) => DevicePasswords::load(path)?,
            None => DevicePasswords::default(),
        };
        let settings = CallbackSettings::new(
            self.retry_count,
            device_passwords,
            self.fetch_device_info,
            self.mqtt_topic_prefix.clone(),
        )?;
        Ok(BridgeConfig::new(mqtt, settings)?)
    }
}

#[cfg(feature = "bluetooth")]
async fn open_device_library(scan_timeout: Duration) -> Result<Arc<dyn DeviceLibrary>, DeviceError> {
    let library = switchbot_mqtt::device::bluetooth::BluetoothLibrary::new(scan_timeout).await?;
    Ok(Arc::new(library))
}

#[cfg(not(feature = "bluetooth"))]
async fn open_device_library(_scan_timeout: Duration) -> Result<Arc<dyn DeviceLibrary>, DeviceError> {
    Err(DeviceError::Unsupported(
        "built without the `bluetooth` feature".into(),
    ))
}

async fn run(args: Args) -> Result<(), BridgeError> {
    let config = args.bridge_config()?;
    let devices = open_device_library(Duration::from_secs(args.scan_timeout_seconds)).await?;

    let bridge = Bridge::connect(config, devices).await?;
    let broker = bridge.broker();
    let running = bridge.run();
    tokio::pin!(running);
    tokio::select! {
        result = &mut running => return result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, disconnecting");
            broker.disconnect().await?;
        }
    }
    // The event loop finishes once DISCONNECT is sent.
    running.await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_tracing(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "switchbot-mqtt stopped");
            ExitCode::FAILURE
        }
    }
}
