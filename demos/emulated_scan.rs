use std::error::Error;

use blueshift::btuuid::{characteristics, services};
use blueshift::emulation::{
    AuthorizationBehavior, EmulatedCentral, EmulatedCentralConfig, EmulatedCharacteristic, EmulatedManagerConfig,
    EmulatedPeripheral, EmulatedService,
};
use blueshift::{CentralManager, CharacteristicProperties, Manager};
use futures_lite::StreamExt;
use tracing::{info, metadata::LevelFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let battery = EmulatedService::new(services::BATTERY).with_characteristic(
        EmulatedCharacteristic::new(
            characteristics::BATTERY_LEVEL,
            CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
        )
        .with_value(vec![87u8]),
    );
    let peripherals = vec![
        EmulatedPeripheral::random().with_name("Thermometer").with_rssi(-71),
        EmulatedPeripheral::random()
            .with_name("Watch")
            .with_rssi(-48)
            .with_service(battery),
        EmulatedPeripheral::random().with_name("Beacon").with_rssi(-90).not_connectable(),
    ];

    let config = EmulatedCentralConfig {
        manager: EmulatedManagerConfig {
            authorization_behavior: AuthorizationBehavior::Success,
            ..Default::default()
        },
        scan_emit_rate: 0.25,
    };
    let manager = CentralManager::new(EmulatedCentral::new(config, peripherals));
    manager.request_authorization();
    manager.ensure_ready(true).await?;

    info!("starting scan");
    let mut scan = manager.scan(&[]);
    let mut found = Vec::new();
    while let Some(peripheral) = scan.next().await {
        let peripheral = peripheral?;
        info!("{} {:?}dBm {:?}", peripheral.name(), peripheral.rssi(), peripheral.advertisement());
        found.push(peripheral);
    }
    info!("scan finished with {} peripherals", found.len());

    for peripheral in found {
        if peripheral.connect().await.is_err() {
            info!("{} refused the connection", peripheral.name());
            continue;
        }
        for service in peripheral.discover_services(&[]).await? {
            for characteristic in service.discover_characteristics(&[]).await? {
                if characteristic.properties().can_read() {
                    let value = characteristic.read().await?;
                    info!("{} / {}: {:?}", service.name(), characteristic.name(), value);
                }
            }
        }
        peripheral.disconnect();
    }

    Ok(())
}
