#![warn(missing_docs)]

//! Gattling is a blocking [Bluetooth Low Energy] GATT client mediator for [Rust].
//!
//! It sits between plain, thread-based application code and an asynchronous
//! platform Bluetooth stack, and mediates exactly one peripheral session at a
//! time: it owns the connection lifecycle, serializes GATT operations onto the
//! stack's one-outstanding-request model, and fans completion events out to
//! subscribers. The platform stack itself lives behind the object-safe traits
//! in [`platform`]; host glue implements them over the real OS API, and the
//! in-tree [`mock`] implements them in memory for tests and demos.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use std::time::Duration;
//!# use gattling::btuuid::bluetooth_uuid_from_u16;
//!# use gattling::mock::MockAdapter;
//!# use gattling::platform::{CharacteristicDef, ServiceDef};
//!# use gattling::{CharacteristicProperties, Event, GattClient};
//!# fn main() -> Result<(), Box<dyn std::error::Error>> {
//!let service = bluetooth_uuid_from_u16(0xffe0);
//!let data = bluetooth_uuid_from_u16(0xffe1);
//!
//!// Host glue would hand over the real platform adapter here.
//!let mock = MockAdapter::new();
//!mock.add_peer(
//!    "AA:BB:CC:DD:EE:FF",
//!    vec![ServiceDef::new(service).with_characteristic(
//!        CharacteristicDef::new(data, CharacteristicProperties::from_bits(0x1a)).with_cccd(),
//!    )],
//!);
//!
//!let client = GattClient::new(Arc::new(mock.clone()));
//!let events = client.events();
//!client.connect("AA:BB:CC:DD:EE:FF")?;
//!
//!// The platform answers on its callback thread; the mock lets us play it.
//!mock.fire_connected();
//!mock.fire_services_discovered(0);
//!
//!while let Ok(event) = events.recv_timeout(Duration::from_secs(1)) {
//!    match event {
//!        Event::ServicesDiscovered(services) => println!("{} services", services.len()),
//!        Event::DataAvailable { characteristic, value } => println!("{characteristic}: {value:?}"),
//!        other => println!("{other:?}"),
//!    }
//!}
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! The primary pieces are:
//!
//! - [`GattClient`]: the mediator facade. [Connect][GattClient::connect],
//!   [disconnect][GattClient::disconnect], and [close][GattClient::close] a
//!   session; [write][GattClient::write_characteristic] and
//!   [read][GattClient::read_characteristic] characteristics;
//!   [subscribe][GattClient::set_characteristic_notification] to
//!   notifications and indications via the CCCD.
//! - [`Service`], [`Characteristic`], [`Descriptor`]: handles into the tree
//!   discovered for the current session. Any disconnect invalidates them.
//! - [`Event`] and [`Subscription`]: the broadcast side. Every subscriber
//!   registered through [`GattClient::events`] sees every session event, in
//!   publish order.
//! - [`Scanner`]: discovery glue collecting advertisement sightings into a
//!   device registry.
//!
//! # Threading model
//!
//! All `GattClient` methods are callable from any thread. Operations that
//! wait for a platform completion park the calling thread on a condition
//! variable until the matching callback arrives, the configured
//! [`operation timeout`][ClientConfig] expires, or the session tears down. At
//! most one GATT operation is outstanding at a time; concurrent callers queue
//! at admission. Events are delivered through per-subscriber channels, so a
//! slow subscriber never blocks the platform callback thread.

pub mod btuuid;
pub mod error;
pub mod mock;
pub mod platform;

mod characteristic;
mod client;
mod descriptor;
mod dispatch;
mod ops;
mod scan;
mod service;
mod session;

pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use client::{ClientConfig, GattClient};
pub use descriptor::Descriptor;
pub use dispatch::{
    Event, Subscription, ACTION_DATA_AVAILABLE, ACTION_GATT_CONNECTED, ACTION_GATT_DISCONNECTED,
    ACTION_GATT_SERVICES_DISCOVERED, EXTRA_DATA,
};
pub use error::Error;
pub use scan::{DiscoveredDevice, Scanner};
pub use service::Service;
pub use session::SessionState;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from the properties byte of a characteristic
    /// declaration.
    pub fn from_bits(bits: u8) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
        }
    }

    /// Raw transmutation to the properties byte of a characteristic
    /// declaration.
    pub fn to_bits(self) -> u8 {
        u8::from(self.broadcast)
            | (u8::from(self.read) << 1)
            | (u8::from(self.write_without_response) << 2)
            | (u8::from(self.write) << 3)
            | (u8::from(self.notify) << 4)
            | (u8::from(self.indicate) << 5)
            | (u8::from(self.authenticated_signed_writes) << 6)
            | (u8::from(self.extended_properties) << 7)
    }
}

/// The acknowledgement mode of a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WriteType {
    /// ATT Write Request; the peer acknowledges the write.
    WithResponse,
    /// ATT Write Command; no acknowledgement from the peer.
    NoResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_round_trip() {
        let props = CharacteristicProperties::from_bits(0x1a);
        assert!(props.read && props.write && props.notify);
        assert!(!props.broadcast && !props.indicate);
        assert_eq!(props.to_bits(), 0x1a);
    }
}
