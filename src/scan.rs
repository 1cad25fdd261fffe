//! LE scanning glue.
//!
//! A [`Scanner`] drives the platform's scanner and folds the advertisement
//! stream into a registry of devices keyed by address, which is how
//! connect-by-address callers find their peer in the first place.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::platform::{Adapter, LeScanner, ScanCallbacks};
use crate::Result;

/// One device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// The advertised address, usable with
    /// [`GattClient::connect`][crate::GattClient::connect].
    pub address: String,
    /// The advertised local name, once any sighting carried one.
    pub name: Option<String>,
    /// Signal strength of the most recent sighting, in dBm.
    pub rssi: i16,
}

/// Collects scan results into a device registry.
///
/// Clones share the scan. The scan stops when [`stop`][Scanner::stop] is
/// called or the last clone is dropped.
#[derive(Clone)]
pub struct Scanner {
    shared: Arc<ScanShared>,
}

struct ScanShared {
    scanner: Arc<dyn LeScanner>,
    scanning: Mutex<bool>,
    registry: Mutex<HashMap<String, DiscoveredDevice>>,
}

// Not derivable: the platform scanner trait object is not `Debug`.
impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner").finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a scanner over `adapter`.
    ///
    /// Errors with [`NotInitialized`][ErrorKind::NotInitialized] when the
    /// adapter is disabled or the stack offers no LE scanner.
    pub fn new(adapter: &dyn Adapter) -> Result<Scanner> {
        if !adapter.is_enabled() {
            return Err(Error::new(
                ErrorKind::NotInitialized,
                None,
                "bluetooth adapter is not enabled",
            ));
        }
        let Some(scanner) = adapter.le_scanner() else {
            return Err(Error::new(
                ErrorKind::NotInitialized,
                None,
                "the stack offers no LE scanner",
            ));
        };
        Ok(Scanner {
            shared: Arc::new(ScanShared {
                scanner,
                scanning: Mutex::new(false),
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Starts scanning, emptying the registry of earlier sightings. Already
    /// scanning is a no-op.
    ///
    /// Errors with [`Rejected`][ErrorKind::Rejected] when the platform
    /// refuses to start.
    pub fn start(&self) -> Result<()> {
        let mut scanning = self.shared.scanning.lock().unwrap();
        if *scanning {
            return Ok(());
        }
        self.shared.registry.lock().unwrap().clear();
        let sink = Arc::new(ScanSink {
            shared: Arc::downgrade(&self.shared),
        });
        if !self.shared.scanner.start_scan(sink) {
            return Err(Error::new(
                ErrorKind::Rejected,
                None,
                "platform refused to start scanning",
            ));
        }
        *scanning = true;
        info!("scan started");
        Ok(())
    }

    /// Stops scanning. The registry keeps its sightings.
    pub fn stop(&self) {
        let mut scanning = self.shared.scanning.lock().unwrap();
        if !*scanning {
            return;
        }
        *scanning = false;
        self.shared.scanner.stop_scan();
        info!("scan stopped");
    }

    /// Whether a scan is currently running.
    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning.lock().unwrap()
    }

    /// Every device seen since the scan started, ordered by address.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let registry = self.shared.registry.lock().unwrap();
        let mut devices: Vec<_> = registry.values().cloned().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    /// Looks up a device by address.
    pub fn device(&self, address: &str) -> Option<DiscoveredDevice> {
        self.shared.registry.lock().unwrap().get(address).cloned()
    }
}

impl Drop for ScanShared {
    fn drop(&mut self) {
        if *self.scanning.get_mut().unwrap() {
            self.scanner.stop_scan();
        }
    }
}

/// Holds the registry weakly so a platform scanner that keeps its callback
/// sink alive cannot keep the registry alive too.
struct ScanSink {
    shared: Weak<ScanShared>,
}

impl ScanCallbacks for ScanSink {
    fn on_scan_result(&self, address: &str, name: Option<&str>, rssi: i16) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut registry = shared.registry.lock().unwrap();
        match registry.get_mut(address) {
            Some(device) => {
                // A sighting without a name does not erase one we have.
                if let Some(name) = name {
                    device.name = Some(name.to_owned());
                }
                device.rssi = rssi;
            }
            None => {
                debug!(%address, ?name, rssi, "discovered device");
                registry.insert(
                    address.to_owned(),
                    DiscoveredDevice {
                        address: address.to_owned(),
                        name: name.map(str::to_owned),
                        rssi,
                    },
                );
            }
        }
    }

    fn on_scan_failed(&self, code: i32) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        warn!(code, "scan failed");
        *shared.scanning.lock().unwrap() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockCall};

    #[test]
    fn requires_an_enabled_adapter() {
        let mock = MockAdapter::new();
        mock.set_enabled(false);
        let err = Scanner::new(&mock).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn sightings_populate_the_registry() {
        let mock = MockAdapter::new();
        let scanner = Scanner::new(&mock).unwrap();
        scanner.start().unwrap();

        mock.advertise("11:22:33:44:55:66", Some("Widget"), -40);
        mock.advertise("11:22:33:44:55:66", None, -47);
        mock.advertise("AA:BB:CC:DD:EE:FF", None, -60);

        let devices = scanner.devices();
        assert_eq!(devices.len(), 2);
        let widget = scanner.device("11:22:33:44:55:66").unwrap();
        assert_eq!(widget.name.as_deref(), Some("Widget"));
        assert_eq!(widget.rssi, -47);
        assert!(scanner.device("AA:BB:CC:DD:EE:FF").unwrap().name.is_none());
    }

    #[test]
    fn restarting_clears_the_registry() {
        let mock = MockAdapter::new();
        let scanner = Scanner::new(&mock).unwrap();
        scanner.start().unwrap();
        mock.advertise("11:22:33:44:55:66", None, -40);
        scanner.stop();
        assert_eq!(scanner.devices().len(), 1);

        scanner.start().unwrap();
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn scan_failure_clears_the_scanning_flag() {
        let mock = MockAdapter::new();
        let scanner = Scanner::new(&mock).unwrap();
        scanner.start().unwrap();
        assert!(scanner.is_scanning());

        mock.fire_scan_failed(2);
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn dropping_the_last_clone_stops_the_scan() {
        let mock = MockAdapter::new();
        let scanner = Scanner::new(&mock).unwrap();
        scanner.start().unwrap();
        let clone = scanner.clone();
        drop(scanner);
        assert!(clone.is_scanning());
        drop(clone);

        assert!(mock
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::StopScan)));
    }
}
