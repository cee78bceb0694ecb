use log::{info, warn};
use std::sync::Arc;

use tokio_stream::StreamExt;

use input_button::{
    BoardConfig, ButtonDriver, DeviceRegistry, InputCore, InputDeviceInfo, InputSubscription,
    PlatformDevice,
};

#[cfg(feature = "hardware-gpio")]
use input_button::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use input_button::MockGpioBackend;

async fn log_events(device: InputDeviceInfo, subscription: InputSubscription) {
    let mut events = Box::pin(subscription.into_stream());
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(text) => info!("input{} ({}): {text}", device.id, device.name),
            Err(e) => warn!("input{}: unable to encode event: {e}", device.id),
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("INPUT_BUTTON_CONFIG").ok())
        .unwrap_or_else(|| "board.json".to_string());
    let board = BoardConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load board description: {e}"));

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodBackend::new()
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::from_board(&board))
        }
    };

    let input = InputCore::new(board.input.clone());
    let registry = DeviceRegistry::new(ButtonDriver::new(
        backend.clone(),
        backend,
        input.clone(),
    ));

    let devices: Vec<PlatformDevice> = board
        .devices
        .iter()
        .cloned()
        .map(PlatformDevice::new)
        .collect();
    let bound = registry.probe_all(&devices);
    info!("Bound {bound} of {} described devices", devices.len());

    let mut readers = Vec::new();
    for device in input.devices() {
        match input.subscribe(device.id) {
            Ok(subscription) => readers.push(tokio::spawn(log_events(device, subscription))),
            Err(e) => warn!("input{}: {e}", device.id),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    registry.remove_all();
    for reader in readers {
        reader.abort();
    }
    Ok(())
}
