use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use serialflow_core::config::{AppConfig, DeviceConfig, InMemoryConfigRepository, LoggingConfig};
use serialflow_core::event::Tagged;
use serialflow_core::logging;
use serialflow_devices::mock::{MockFailure, MockTransportFactory};
use serialflow_devices::{ConnectionStateChanged, DeviceCoordinator, DeviceId, DeviceStatusChanged};

fn demo_config() -> AppConfig {
    let mut config = AppConfig {
        logging: LoggingConfig {
            level: "info,serialflow_devices=debug".to_string(),
            with_target: false,
        },
        ..AppConfig::default()
    };

    for (id, port) in [(DeviceId::Fcc1, "COM1"), (DeviceId::Fcc2, "COM2"), (DeviceId::Hil, "COM9")] {
        config.devices.insert(
            id.to_string(),
            DeviceConfig {
                port: port.to_string(),
                locked: true,
                ..DeviceConfig::named(id.to_string())
            },
        );
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = demo_config();
    logging::init_from_config(&config.logging).context("failed to initialize logging")?;

    // Simulated hardware: FCC2 is flaky, HIL never answers
    let factory = MockTransportFactory::new();
    factory.port("COM2").fail_next_opens(2, MockFailure::Timeout);
    factory.port("COM9").fail_all_opens(Some(MockFailure::Unavailable));

    let repository = Arc::new(InMemoryConfigRepository::new(config));
    let coordinator = DeviceCoordinator::new(repository.clone(), Arc::new(factory.clone()));
    coordinator.initialize().await?;

    let events = coordinator.events();
    let mut states = events.subscribe::<Tagged<DeviceId, ConnectionStateChanged>>()?;
    let mut statuses = events.subscribe::<Tagged<DeviceId, DeviceStatusChanged>>()?;
    tokio::spawn(async move {
        while let Ok(Tagged { source, event }) = states.recv().await {
            match event.message {
                Some(message) => warn!("[{}] {} -> {}: {}", source, event.old_state, event.new_state, message),
                None => info!("[{}] {} -> {}", source, event.old_state, event.new_state),
            }
        }
    });
    tokio::spawn(async move {
        while let Ok(Tagged { source, event }) = statuses.recv().await {
            info!("[{}] power {}", source, event.status.power_state);
        }
    });

    let cancel = CancellationToken::new();
    let results = coordinator.connect_all(&cancel).await?;
    for id in DeviceId::ALL {
        info!("{} connected: {}", id, results[&id]);
    }

    let mut received = coordinator.receive_stream(DeviceId::Fcc1, &cancel)?;
    coordinator.turn_on(DeviceId::Fcc1, &cancel).await?;
    factory.port("COM1").push_incoming("PWR:1\n");
    if let Some(text) = received.next().await {
        info!("FCC1 replied: {}", text.trim_end());
    }

    coordinator.turn_off(DeviceId::Fcc2, &cancel).await?;
    sleep(Duration::from_millis(100)).await;

    coordinator.disconnect_all(&cancel).await?;
    coordinator.dispose();
    info!("Configuration saved {} time(s)", repository.save_count());

    Ok(())
}
