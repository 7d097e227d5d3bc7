//! # Observability & Tracing
//!
//! [`setup_tracing`] initializes structured logging with the `tracing`
//! crate. Every module logs through `tracing` macros with structured fields
//! (`mac`, `topic`, `kind`, `operation`, `error`), so log lines can be
//! filtered per device.
//!
//! ## Configuration
//!
//! - `RUST_LOG` takes precedence when set.
//! - Otherwise the level is `info`, or `debug` with `--debug`.
//! - Compact format without the module prefix (`with_target(false)`).
//!
//! ```bash
//! RUST_LOG=switchbot_mqtt::framework=debug switchbot-mqtt --mqtt-host localhost
//! ```
//!
//! ## What Gets Traced
//!
//! At `info`: broker connection, subscriptions, executed commands and
//! ignored retained messages. At `warn`: dropped messages (topic mismatch,
//! invalid MAC, unexpected payload) and retried device operations. At
//! `error`: failed device sessions and publishes.
//!
//! `debug` adds every received and published payload:
//!
//! ```text
//! DEBUG Received message topic=homeassistant/switchbot/aa:bb:cc:dd:ee:ff/set-position payload="42"
//! INFO Switchbot curtain command done mac=aa:bb:cc:dd:ee:ff command=SetPosition(42)
//! DEBUG Publishing topic=homeassistant/switchbot/aa:bb:cc:dd:ee:ff/state payload="42"
//! ```

use tracing_subscriber::EnvFilter;

pub fn setup_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
