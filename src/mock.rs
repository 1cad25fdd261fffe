//! An in-memory platform stack for tests and demos.
//!
//! [`MockAdapter`] implements the [`platform`][crate::platform] traits with
//! no radio behind them. Peers and their GATT databases are declared up
//! front with [`add_peer`][MockAdapter::add_peer]; every request the
//! mediator submits is recorded as a [`MockCall`]; and the test plays the
//! platform's callback side with the `fire_*` and `ack_*` methods, which
//! deliver on the calling thread the same way a platform callback thread
//! would.
//!
//! This is test infrastructure: misuse panics. Acknowledging a write that
//! was never submitted, or firing GATT callbacks with no connection, is a
//! bug in the test rather than a condition to report.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::platform::{
    Adapter, GattCallbacks, GattLink, LeScanner, LinkState, Peripheral, ScanCallbacks, ServiceDef,
};
use crate::{Result, WriteType};

/// One request the mediator submitted to the platform, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// [`Peripheral::connect_gatt`] was called.
    Connect {
        /// The peer address the connection was opened to.
        address: String,
    },
    /// [`GattLink::discover_services`] was called.
    DiscoverServices,
    /// [`GattLink::read_characteristic`] was called.
    ReadCharacteristic {
        /// The service the characteristic belongs to.
        service: Uuid,
        /// The characteristic that was read.
        characteristic: Uuid,
    },
    /// [`GattLink::write_characteristic`] was called.
    WriteCharacteristic {
        /// The service the characteristic belongs to.
        service: Uuid,
        /// The characteristic that was written.
        characteristic: Uuid,
        /// The bytes submitted.
        value: Vec<u8>,
        /// The acknowledgement mode of this write.
        write_type: WriteType,
    },
    /// [`GattLink::write_descriptor`] was called.
    WriteDescriptor {
        /// The service the descriptor's characteristic belongs to.
        service: Uuid,
        /// The characteristic the descriptor belongs to.
        characteristic: Uuid,
        /// The descriptor that was written.
        descriptor: Uuid,
        /// The bytes submitted.
        value: Vec<u8>,
    },
    /// [`GattLink::set_characteristic_notification`] was called.
    SetNotification {
        /// The characteristic whose routing changed.
        characteristic: Uuid,
        /// The requested routing state.
        enabled: bool,
    },
    /// [`GattLink::disconnect`] was called.
    Disconnect,
    /// [`GattLink::close`] was called.
    Close,
    /// [`LeScanner::start_scan`] was called.
    StartScan,
    /// [`LeScanner::stop_scan`] was called.
    StopScan,
}

struct MockCore {
    enabled: AtomicBool,
    accept: AtomicBool,
    peers: Mutex<HashMap<String, Vec<ServiceDef>>>,
    callbacks: Mutex<Option<Arc<dyn GattCallbacks>>>,
    scan_callbacks: Mutex<Option<Arc<dyn ScanCallbacks>>>,
    log: Mutex<Vec<MockCall>>,
    log_cond: Condvar,
}

impl MockCore {
    fn record(&self, call: MockCall) {
        self.log.lock().unwrap().push(call);
        self.log_cond.notify_all();
    }

    // Clones the sink out so no mock lock is held while callbacks run.
    fn gatt_callbacks(&self) -> Arc<dyn GattCallbacks> {
        self.callbacks
            .lock()
            .unwrap()
            .clone()
            .expect("no GATT connection; connect_gatt was never called")
    }

    fn scan_callbacks(&self) -> Arc<dyn ScanCallbacks> {
        self.scan_callbacks
            .lock()
            .unwrap()
            .clone()
            .expect("no scan in progress; start_scan was never called")
    }
}

/// The in-memory [`Adapter`]. Clones share all state.
#[derive(Clone)]
pub struct MockAdapter {
    core: Arc<MockCore>,
}

impl MockAdapter {
    /// Creates an enabled adapter that knows no peers.
    pub fn new() -> Self {
        MockAdapter {
            core: Arc::new(MockCore {
                enabled: AtomicBool::new(true),
                accept: AtomicBool::new(true),
                peers: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(None),
                scan_callbacks: Mutex::new(None),
                log: Mutex::new(Vec::new()),
                log_cond: Condvar::new(),
            }),
        }
    }

    /// Powers the radio on or off. A disabled adapter also offers no
    /// scanner.
    pub fn set_enabled(&self, enabled: bool) {
        self.core.enabled.store(enabled, Ordering::SeqCst);
    }

    /// When `false`, every [`GattLink`] submission is refused (returns
    /// `false`) instead of being recorded.
    pub fn set_submissions_accepted(&self, accepted: bool) {
        self.core.accept.store(accepted, Ordering::SeqCst);
    }

    /// Declares a connectable peer and the GATT database its service
    /// discovery will report.
    pub fn add_peer(&self, address: &str, services: Vec<ServiceDef>) {
        self.core.peers.lock().unwrap().insert(address.to_owned(), services);
    }

    /// A snapshot of every request submitted so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.core.log.lock().unwrap().clone()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.core.log.lock().unwrap().clear();
    }

    /// Blocks until the call log satisfies `ready`, or `timeout` elapses.
    /// Returns whether it did. The predicate sees the whole log, so it can
    /// wait for a particular call as easily as for a count of them.
    pub fn wait_for(&self, timeout: Duration, ready: impl Fn(&[MockCall]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = self.core.log.lock().unwrap();
        loop {
            if ready(&log) {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self.core.log_cond.wait_timeout(log, remaining).unwrap();
            log = guard;
        }
    }

    /// Reports the link up, as the platform does once a connection attempt
    /// succeeds.
    pub fn fire_connected(&self) {
        self.core
            .gatt_callbacks()
            .on_connection_state_change(LinkState::Connected, 0);
    }

    /// Reports the link down, as the platform does after a
    /// [`disconnect`][GattLink::disconnect], a connection attempt that gave
    /// up, or a supervision timeout.
    pub fn fire_disconnected(&self) {
        self.core
            .gatt_callbacks()
            .on_connection_state_change(LinkState::Disconnected, 0);
    }

    /// Reports service discovery finished with `status`.
    pub fn fire_services_discovered(&self, status: u8) {
        self.core.gatt_callbacks().on_services_discovered(status);
    }

    /// Completes a characteristic read with `value` and `status`.
    pub fn fire_characteristic_read(&self, service: Uuid, characteristic: Uuid, value: &[u8], status: u8) {
        self.core
            .gatt_callbacks()
            .on_characteristic_read(service, characteristic, value, status);
    }

    /// Completes the most recently submitted characteristic write with
    /// `status`.
    pub fn ack_characteristic_write(&self, status: u8) {
        let (service, characteristic) = {
            let log = self.core.log.lock().unwrap();
            log.iter()
                .rev()
                .find_map(|call| match call {
                    MockCall::WriteCharacteristic {
                        service,
                        characteristic,
                        ..
                    } => Some((*service, *characteristic)),
                    _ => None,
                })
                .expect("no characteristic write to acknowledge")
        };
        self.core
            .gatt_callbacks()
            .on_characteristic_write(service, characteristic, status);
    }

    /// Completes the most recently submitted descriptor write with
    /// `status`, reading back exactly the bytes that were written. This is
    /// the well-behaved-peer case.
    pub fn ack_descriptor_write(&self, status: u8) {
        let (service, characteristic, descriptor, value) = self.last_descriptor_write();
        self.core
            .gatt_callbacks()
            .on_descriptor_write(service, characteristic, descriptor, &value, status);
    }

    /// Completes the most recently submitted descriptor write with
    /// `status` and an arbitrary read-back, for peers whose descriptor does
    /// not (yet) hold what was written.
    pub fn ack_descriptor_write_with_value(&self, status: u8, read_back: &[u8]) {
        let (service, characteristic, descriptor, _) = self.last_descriptor_write();
        self.core
            .gatt_callbacks()
            .on_descriptor_write(service, characteristic, descriptor, read_back, status);
    }

    /// Pushes a notification or indication from the peer.
    pub fn fire_characteristic_changed(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.core
            .gatt_callbacks()
            .on_characteristic_changed(service, characteristic, value);
    }

    /// Delivers an advertisement sighting to the active scan.
    pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) {
        self.core.scan_callbacks().on_scan_result(address, name, rssi);
    }

    /// Reports the active scan as failed with a platform error code.
    pub fn fire_scan_failed(&self, code: i32) {
        self.core.scan_callbacks().on_scan_failed(code);
    }

    fn last_descriptor_write(&self) -> (Uuid, Uuid, Uuid, Vec<u8>) {
        let log = self.core.log.lock().unwrap();
        log.iter()
            .rev()
            .find_map(|call| match call {
                MockCall::WriteDescriptor {
                    service,
                    characteristic,
                    descriptor,
                    value,
                } => Some((*service, *characteristic, *descriptor, value.clone())),
                _ => None,
            })
            .expect("no descriptor write to acknowledge")
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for MockAdapter {
    fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::SeqCst)
    }

    fn remote_device(&self, address: &str) -> Option<Arc<dyn Peripheral>> {
        let peers = self.core.peers.lock().unwrap();
        peers.contains_key(address).then(|| {
            Arc::new(MockPeripheral {
                core: self.core.clone(),
                address: address.to_owned(),
            }) as Arc<dyn Peripheral>
        })
    }

    fn le_scanner(&self) -> Option<Arc<dyn LeScanner>> {
        self.is_enabled()
            .then(|| Arc::new(MockScanner { core: self.core.clone() }) as Arc<dyn LeScanner>)
    }
}

struct MockPeripheral {
    core: Arc<MockCore>,
    address: String,
}

impl Peripheral for MockPeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn connect_gatt(&self, callbacks: Arc<dyn GattCallbacks>) -> Result<Arc<dyn GattLink>> {
        let services = self
            .core
            .peers
            .lock()
            .unwrap()
            .get(&self.address)
            .cloned()
            .unwrap_or_default();
        *self.core.callbacks.lock().unwrap() = Some(callbacks);
        self.core.record(MockCall::Connect {
            address: self.address.clone(),
        });
        Ok(Arc::new(MockLink {
            core: self.core.clone(),
            services,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockLink {
    core: Arc<MockCore>,
    services: Vec<ServiceDef>,
    closed: AtomicBool,
}

impl MockLink {
    fn accepts(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.core.accept.load(Ordering::SeqCst)
    }
}

impl GattLink for MockLink {
    fn discover_services(&self) -> bool {
        if !self.accepts() {
            return false;
        }
        self.core.record(MockCall::DiscoverServices);
        true
    }

    fn services(&self) -> Vec<ServiceDef> {
        self.services.clone()
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        if !self.accepts() {
            return false;
        }
        self.core.record(MockCall::ReadCharacteristic { service, characteristic });
        true
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        if !self.accepts() {
            return false;
        }
        self.core.record(MockCall::WriteCharacteristic {
            service,
            characteristic,
            value: value.to_vec(),
            write_type,
        });
        true
    }

    fn write_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> bool {
        if !self.accepts() {
            return false;
        }
        self.core.record(MockCall::WriteDescriptor {
            service,
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        true
    }

    fn set_characteristic_notification(&self, _service: Uuid, characteristic: Uuid, enabled: bool) -> bool {
        if !self.accepts() {
            return false;
        }
        self.core.record(MockCall::SetNotification { characteristic, enabled });
        true
    }

    fn disconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.core.record(MockCall::Disconnect);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // No callbacks may follow a close; dropping the sink enforces it.
        self.core.callbacks.lock().unwrap().take();
        self.core.record(MockCall::Close);
    }
}

struct MockScanner {
    core: Arc<MockCore>,
}

impl LeScanner for MockScanner {
    fn start_scan(&self, callbacks: Arc<dyn ScanCallbacks>) -> bool {
        *self.core.scan_callbacks.lock().unwrap() = Some(callbacks);
        self.core.record(MockCall::StartScan);
        true
    }

    fn stop_scan(&self) {
        self.core.scan_callbacks.lock().unwrap().take();
        self.core.record(MockCall::StopScan);
    }
}

/// A callback sink that ignores everything it is told.
///
/// Handy when a test needs a live link without a mediator behind it.
pub struct NullCallbacks;

impl GattCallbacks for NullCallbacks {
    fn on_connection_state_change(&self, _state: LinkState, _status: u8) {}

    fn on_services_discovered(&self, _status: u8) {}

    fn on_characteristic_read(&self, _service: Uuid, _characteristic: Uuid, _value: &[u8], _status: u8) {}

    fn on_characteristic_write(&self, _service: Uuid, _characteristic: Uuid, _status: u8) {}

    fn on_descriptor_write(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
        _value: &[u8],
        _status: u8,
    ) {
    }

    fn on_characteristic_changed(&self, _service: Uuid, _characteristic: Uuid, _value: &[u8]) {}
}
