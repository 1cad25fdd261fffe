use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use gattling::btuuid::bluetooth_uuid_from_u16;
use gattling::mock::MockAdapter;
use gattling::platform::{CharacteristicDef, ServiceDef};
use gattling::{CharacteristicProperties, Event, GattClient, Scanner};
use tracing::info;
use tracing::metadata::LevelFilter;

fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // An in-memory peripheral; host glue would hand over the real adapter.
    let heart_rate = bluetooth_uuid_from_u16(0x180d);
    let measurement = bluetooth_uuid_from_u16(0x2a37);
    let mock = MockAdapter::new();
    mock.add_peer(
        "AA:BB:CC:DD:EE:FF",
        vec![ServiceDef::new(heart_rate).with_characteristic(
            CharacteristicDef::new(measurement, CharacteristicProperties::from_bits(0x10))
                .with_cccd(),
        )],
    );

    info!("starting scan");
    let scanner = Scanner::new(&mock)?;
    scanner.start()?;
    mock.advertise("AA:BB:CC:DD:EE:FF", Some("Polar H10"), -52);
    mock.advertise("AA:BB:CC:DD:EE:FF", None, -48);
    scanner.stop();
    for device in scanner.devices() {
        info!(address = %device.address, name = ?device.name, rssi = device.rssi, "seen");
    }
    let target = scanner
        .device("AA:BB:CC:DD:EE:FF")
        .ok_or("peer never advertised")?;

    let client = GattClient::new(Arc::new(mock.clone()));
    let events = client.events();
    client.connect(&target.address)?;

    // The platform's callback side, played by the mock.
    let platform = std::thread::spawn({
        let mock = mock.clone();
        move || {
            mock.fire_connected();
            mock.fire_services_discovered(0);
        }
    });

    loop {
        match events.recv_timeout(Duration::from_secs(1))? {
            Event::Connected => info!("connected!"),
            Event::ServicesDiscovered(services) => {
                for service in &services {
                    info!(service = %service.uuid(), "discovered service");
                    for characteristic in service.characteristics() {
                        info!(
                            characteristic = %characteristic.uuid(),
                            properties = ?characteristic.properties(),
                            "discovered characteristic"
                        );
                    }
                }
                break;
            }
            other => info!(?other, "event"),
        }
    }
    platform.join().unwrap();

    client.close();
    info!("closed");
    Ok(())
}
