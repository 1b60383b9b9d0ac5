//! `brickwire enumerate`: list attached devices.

use std::collections::BTreeMap;
use std::time::Duration;

use brickwire_protocol::{EnumerateEvent, EnumerationType};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::IpConnection;
use crate::dispatcher::{CallbackEvent, CallbackKey};
use crate::error::{ClientError, ClientResult};

/// Connects, collects enumerate callbacks for `wait` and prints them.
pub async fn run(config: &ClientConfig, json: bool, wait: Duration) -> ClientResult<()> {
    let connection = IpConnection::with_config(config)?;
    connection.set_auto_reconnect(false);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    connection.register_callback(CallbackKey::enumerate(), move |event| {
        if let CallbackEvent::Enumerate(device) = event {
            let _ = events_tx.send(device.clone());
        }
    });

    // connecting broadcasts the enumerate request
    connection
        .connect(&config.connection.host, config.connection.port)
        .await?;
    tokio::time::sleep(wait).await;
    connection.disconnect().await?;
    connection.flush_callbacks().await;
    connection.unregister_callback(CallbackKey::enumerate());

    let mut received = Vec::new();
    while let Ok(device) = events.try_recv() {
        received.push(device);
    }
    debug!(callbacks = received.len(), "enumeration finished");

    let devices = collect(received);
    if json {
        for device in &devices {
            let line = serde_json::to_string(device)
                .map_err(|e| ClientError::invalid_argument(format!("failed to encode device: {e}")))?;
            println!("{line}");
        }
    } else if devices.is_empty() {
        println!("No devices found.");
    } else {
        print!("{}", render(&devices));
    }
    Ok(())
}

/// Keeps the latest event per UID and drops devices that disconnected.
pub fn collect(events: impl IntoIterator<Item = EnumerateEvent>) -> Vec<EnumerateEvent> {
    let mut devices = BTreeMap::new();
    for event in events {
        if event.enumeration_type == EnumerationType::Disconnected {
            devices.remove(&event.uid);
        } else {
            devices.insert(event.uid.clone(), event);
        }
    }
    devices.into_values().collect()
}

/// Renders devices as an aligned table.
pub fn render(devices: &[EnumerateEvent]) -> String {
    let mut out = format!(
        "{:<8} {:<8} {:<3} {:>6} {:<8} {}\n",
        "UID", "PARENT", "POS", "ID", "HW", "FW"
    );
    for device in devices {
        out.push_str(&format!(
            "{:<8} {:<8} {:<3} {:>6} {:<8} {}\n",
            device.uid,
            device.connected_uid,
            device.position,
            device.device_identifier,
            version(device.hardware_version),
            version(device.firmware_version),
        ));
    }
    out
}

fn version([major, minor, release]: [u8; 3]) -> String {
    format!("{major}.{minor}.{release}")
}
