use log::{debug, error, info, warn};
use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use linemgr::{AppConfig, GpioBackend, GpioManager};

#[cfg(feature = "hardware-gpio")]
use linemgr::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use linemgr::MockGpioBackend;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LINEMGR_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

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
            warn!("built without hardware-gpio, using the in-memory board");
            Arc::new(MockGpioBackend::default())
        }
    };

    run(&config, backend).await
}

async fn run<B: GpioBackend + 'static>(config: &AppConfig, backend: Arc<B>) -> std::io::Result<()> {
    let manager = GpioManager::from_config(config, backend)
        .unwrap_or_else(|e| panic!("Invalid pin configuration: {e}"));
    manager
        .start()
        .unwrap_or_else(|e| panic!("Failed to start line manager: {e}"));

    let mut inputs: Vec<_> = manager
        .registry()
        .iter()
        .filter(|d| d.is_input())
        .cloned()
        .collect();
    inputs.sort_by_key(|d| d.id);
    for descriptor in inputs {
        let name = descriptor.name.clone();
        match manager.subscribe(descriptor.id, move |event| {
            info!("pin {} ({name}) {:?}", event.pin, event.transition);
            Ok(())
        }) {
            Ok(_) => info!("watching pin {} ({})", descriptor.id, descriptor.name),
            Err(e) => error!("cannot watch pin {}: {e}", descriptor.id),
        }
    }

    for status in manager.list_pins().unwrap_or_default() {
        info!(
            "pin {} ({}, {}) level {:?}",
            status.descriptor.id, status.descriptor.name, status.descriptor.direction, status.level
        );
    }

    let mut events = manager
        .event_stream()
        .unwrap_or_else(|e| panic!("Failed to open event stream: {e}"));
    let watcher = tokio::spawn(async move {
        let mut seen = 0u64;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    seen += 1;
                    debug!("edge #{seen}: pin {} {:?}", event.pin, event.transition);
                }
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("event stream lagged by {n} messages");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("termination requested");

    if let Err(e) = manager.shutdown() {
        error!("shutdown failed: {e}");
    }
    watcher.abort();
    Ok(())
}
