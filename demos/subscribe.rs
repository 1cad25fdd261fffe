use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gattling::btuuid::bluetooth_uuid_from_u16;
use gattling::mock::{MockAdapter, MockCall};
use gattling::platform::{CharacteristicDef, ServiceDef};
use gattling::{CharacteristicProperties, Event, GattClient};
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

    let uart = bluetooth_uuid_from_u16(0xffe0);
    let rx = bluetooth_uuid_from_u16(0xffe1);
    let mock = MockAdapter::new();
    mock.add_peer(
        "AA:BB:CC:DD:EE:FF",
        vec![ServiceDef::new(uart).with_characteristic(
            CharacteristicDef::new(rx, CharacteristicProperties::from_bits(0x1a)).with_cccd(),
        )],
    );

    // The platform's callback side: confirm what the mediator submits, then
    // push a few notifications.
    let platform = thread::spawn({
        let mock = mock.clone();
        let wait = Duration::from_secs(5);
        move || {
            assert!(mock.wait_for(wait, |log| {
                log.iter().any(|call| matches!(call, MockCall::Connect { .. }))
            }));
            mock.fire_connected();
            mock.fire_services_discovered(0);

            assert!(mock.wait_for(wait, |log| {
                log.iter().any(|call| matches!(call, MockCall::WriteDescriptor { .. }))
            }));
            mock.ack_descriptor_write(0);

            for beat in [60u8, 61, 63] {
                thread::sleep(Duration::from_millis(50));
                mock.fire_characteristic_changed(uart, rx, &[beat]);
            }

            assert!(mock.wait_for(wait, |log| {
                log.iter().any(|call| matches!(call, MockCall::WriteCharacteristic { .. }))
            }));
            mock.ack_characteristic_write(0);

            assert!(mock.wait_for(wait, |log| {
                log.iter().any(|call| matches!(call, MockCall::Disconnect))
            }));
            mock.fire_disconnected();
        }
    });

    let client = GattClient::new(Arc::new(mock.clone()));
    let events = client.events();
    client.connect("AA:BB:CC:DD:EE:FF")?;
    while !matches!(
        events.recv_timeout(Duration::from_secs(1))?,
        Event::ServicesDiscovered(_)
    ) {}

    let characteristic = client
        .service(uart)
        .ok_or("service missing")?
        .characteristic(rx)
        .ok_or("characteristic missing")?;

    client.set_characteristic_notification(&characteristic, true)?;
    info!("subscribed");

    for _ in 0..3 {
        if let Event::DataAvailable { value, .. } = events.recv_timeout(Duration::from_secs(1))? {
            info!(?value, "notification");
        }
    }

    client.write_characteristic_str(&characteristic, "thanks")?;
    client.disconnect();
    loop {
        if matches!(events.recv_timeout(Duration::from_secs(1))?, Event::Disconnected) {
            info!("disconnected!");
            break;
        }
    }
    platform.join().unwrap();
    Ok(())
}
