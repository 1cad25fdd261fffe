use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::platform::DescriptorDef;

/// Standard values for the client characteristic configuration descriptor.
///
/// Writing one of these two-byte patterns to a characteristic's CCCD arms or
/// disarms server-initiated updates, per the Bluetooth Core Specification,
/// Vol 3, Part G, §3.3.3.3.
pub mod cccd {
    /// Notifications on: `{0x01, 0x00}`.
    pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
    /// Indications on: `{0x02, 0x00}`.
    pub const ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];
    /// Notifications and indications off: `{0x00, 0x00}`.
    pub const DISABLE: [u8; 2] = [0x00, 0x00];
}

pub(crate) struct DescriptorInner {
    pub(crate) uuid: Uuid,
    pub(crate) characteristic_uuid: Uuid,
    value: Mutex<Vec<u8>>,
}

impl DescriptorInner {
    pub(crate) fn from_def(characteristic_uuid: Uuid, def: &DescriptorDef) -> Arc<Self> {
        Arc::new(DescriptorInner {
            uuid: def.uuid,
            characteristic_uuid,
            value: Mutex::new(def.value.clone()),
        })
    }

    pub(crate) fn value(&self) -> Vec<u8> {
        self.value.lock().unwrap().clone()
    }

    pub(crate) fn set_value(&self, value: &[u8]) {
        *self.value.lock().unwrap() = value.to_vec();
    }

    pub(crate) fn value_equals(&self, expected: &[u8]) -> bool {
        *self.value.lock().unwrap() == expected
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Descriptor {
        Descriptor {
            uuid: self.uuid,
            characteristic_uuid: self.characteristic_uuid,
            inner: Arc::downgrade(self),
        }
    }
}

/// A handle to a GATT descriptor discovered for the current session.
///
/// Handles outlive the session only as identifiers; once the session
/// disconnects, value accessors return `None`.
#[derive(Debug, Clone)]
pub struct Descriptor {
    uuid: Uuid,
    characteristic_uuid: Uuid,
    inner: Weak<DescriptorInner>,
}

impl Descriptor {
    /// The [`Uuid`] identifying the type of this GATT descriptor
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The [`Uuid`] of the characteristic this descriptor belongs to
    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// The last value reported by the platform for this descriptor, or
    /// `None` once the session that discovered it has disconnected.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.upgrade().map(|inner| inner.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
    use crate::btuuid::bluetooth_uuid_from_u16;

    fn cccd_inner() -> Arc<DescriptorInner> {
        let def = DescriptorDef {
            uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
            value: vec![0x00, 0x00],
        };
        DescriptorInner::from_def(bluetooth_uuid_from_u16(0xffe1), &def)
    }

    #[test]
    fn read_back_cell_tracks_the_last_reported_value() {
        let inner = cccd_inner();
        assert!(inner.value_equals(&cccd::DISABLE));

        inner.set_value(&cccd::ENABLE_NOTIFICATION);
        assert!(inner.value_equals(&cccd::ENABLE_NOTIFICATION));
        assert!(!inner.value_equals(&cccd::ENABLE_INDICATION));
        assert_eq!(inner.handle().value(), Some(vec![0x01, 0x00]));
    }

    #[test]
    fn handles_lose_their_value_when_the_tree_drops() {
        let inner = cccd_inner();
        let handle = inner.handle();
        drop(inner);

        assert_eq!(handle.value(), None);
        assert_eq!(handle.uuid(), CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(handle.characteristic_uuid(), bluetooth_uuid_from_u16(0xffe1));
    }
}
