//! The platform Bluetooth stack boundary.
//!
//! The mediator in this crate does not talk to any OS Bluetooth API
//! directly. Host glue implements the traits in this module over the real
//! stack (one callback thread, boolean accept/refuse submissions, raw ATT
//! status bytes) and hands the [`Adapter`] to
//! [`GattClient`][crate::GattClient]. The in-tree implementation is
//! [`mock`][crate::mock], which the tests and demos drive.

use std::sync::Arc;

use uuid::Uuid;

use crate::{CharacteristicProperties, Result, WriteType};

/// Link-level connection state reported by
/// [`GattCallbacks::on_connection_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link to the peripheral came up.
    Connected,
    /// The link to the peripheral went down.
    Disconnected,
}

/// The host radio.
pub trait Adapter: Send + Sync {
    /// Whether the radio is present and powered on.
    fn is_enabled(&self) -> bool;

    /// Resolves a peer address to a connectable peripheral handle.
    ///
    /// Returns `None` when the address cannot be resolved (malformed, or
    /// unknown to the stack).
    fn remote_device(&self, address: &str) -> Option<Arc<dyn Peripheral>>;

    /// The LE scanner, if the stack currently offers one.
    fn le_scanner(&self) -> Option<Arc<dyn LeScanner>>;
}

/// A remote peripheral known to the stack.
pub trait Peripheral: Send + Sync {
    /// The peer address this handle was resolved from.
    fn address(&self) -> String;

    /// Opens a GATT connection attempt and registers the callback sink for
    /// its whole lifetime.
    ///
    /// Contract: the connection attempt is asynchronous. Implementations
    /// must deliver callbacks from their callback thread, never from inside
    /// this call.
    fn connect_gatt(&self, callbacks: Arc<dyn GattCallbacks>) -> Result<Arc<dyn GattLink>>;
}

/// A live platform GATT handle for one connection.
///
/// Submission methods return `true` when the stack accepted the request and
/// will report completion through [`GattCallbacks`], `false` when it refused
/// outright. Attributes are addressed by UUID path.
pub trait GattLink: Send + Sync {
    /// Requests service discovery.
    fn discover_services(&self) -> bool;

    /// The services discovered so far. Meaningful only after a successful
    /// [`GattCallbacks::on_services_discovered`].
    fn services(&self) -> Vec<ServiceDef>;

    /// Submits a characteristic read.
    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Submits a characteristic write.
    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;

    /// Submits a descriptor write.
    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    /// Routes notifications and indications for the characteristic to
    /// [`GattCallbacks::on_characteristic_changed`]. This is the local
    /// routing switch only; the peer is armed through its CCCD.
    fn set_characteristic_notification(&self, service: Uuid, characteristic: Uuid, enabled: bool) -> bool;

    /// Requests an orderly link teardown. Completion is reported as a
    /// disconnected state change.
    fn disconnect(&self);

    /// Releases the handle. No callbacks may be delivered afterwards.
    fn close(&self);
}

/// The callback sink a [`Peripheral::connect_gatt`] call registers.
///
/// All methods are invoked on the platform's callback thread. `status` is
/// the raw ATT status byte, zero for success.
pub trait GattCallbacks: Send + Sync {
    /// The link came up or went down.
    fn on_connection_state_change(&self, state: LinkState, status: u8);

    /// Service discovery finished.
    fn on_services_discovered(&self, status: u8);

    /// A characteristic read completed.
    fn on_characteristic_read(&self, service: Uuid, characteristic: Uuid, value: &[u8], status: u8);

    /// A characteristic write completed.
    fn on_characteristic_write(&self, service: Uuid, characteristic: Uuid, status: u8);

    /// A descriptor write completed. `value` is the platform's read-back of
    /// the descriptor after the write, not an echo of the request.
    fn on_descriptor_write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
        status: u8,
    );

    /// The peripheral pushed a new value (notification or indication).
    fn on_characteristic_changed(&self, service: Uuid, characteristic: Uuid, value: &[u8]);
}

/// An LE scanner offered by the stack.
pub trait LeScanner: Send + Sync {
    /// Starts scanning, reporting sightings to `callbacks` until
    /// [`stop_scan`][LeScanner::stop_scan].
    fn start_scan(&self, callbacks: Arc<dyn ScanCallbacks>) -> bool;

    /// Stops scanning.
    fn stop_scan(&self);
}

/// The callback sink for scan results.
pub trait ScanCallbacks: Send + Sync {
    /// An advertisement was seen.
    fn on_scan_result(&self, address: &str, name: Option<&str>, rssi: i16);

    /// Scanning failed to start or aborted.
    fn on_scan_failed(&self, code: i32);
}

/// One discovered service, as reported by [`GattLink::services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    /// The service UUID.
    pub uuid: Uuid,
    /// The characteristics the service contains.
    pub characteristics: Vec<CharacteristicDef>,
}

impl ServiceDef {
    /// Creates an empty service definition.
    pub fn new(uuid: Uuid) -> Self {
        ServiceDef {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Appends a characteristic.
    pub fn with_characteristic(mut self, characteristic: CharacteristicDef) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// One discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDef {
    /// The characteristic UUID.
    pub uuid: Uuid,
    /// The property bits reported by the peer.
    pub properties: CharacteristicProperties,
    /// The descriptors the characteristic carries.
    pub descriptors: Vec<DescriptorDef>,
}

impl CharacteristicDef {
    /// Creates a characteristic definition with no descriptors.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        CharacteristicDef {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Appends a descriptor with an initial value.
    pub fn with_descriptor(mut self, uuid: Uuid, value: Vec<u8>) -> Self {
        self.descriptors.push(DescriptorDef { uuid, value });
        self
    }

    /// Appends a client characteristic configuration descriptor, initially
    /// all-off.
    pub fn with_cccd(self) -> Self {
        self.with_descriptor(
            crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0x00, 0x00],
        )
    }
}

/// One discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDef {
    /// The descriptor UUID.
    pub uuid: Uuid,
    /// The descriptor value at discovery time.
    pub value: Vec<u8>,
}
