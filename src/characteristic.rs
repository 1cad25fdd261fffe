use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::descriptor::{Descriptor, DescriptorInner};
use crate::platform::CharacteristicDef;
use crate::{btuuid, CharacteristicProperties, WriteType};

pub(crate) struct CharacteristicInner {
    pub(crate) uuid: Uuid,
    pub(crate) service_uuid: Uuid,
    pub(crate) properties: CharacteristicProperties,
    write_type: Mutex<WriteType>,
    value: Mutex<Vec<u8>>,
    pub(crate) descriptors: Vec<Arc<DescriptorInner>>,
}

impl CharacteristicInner {
    pub(crate) fn from_def(service_uuid: Uuid, def: &CharacteristicDef) -> Arc<Self> {
        Arc::new(CharacteristicInner {
            uuid: def.uuid,
            service_uuid,
            properties: def.properties,
            write_type: Mutex::new(WriteType::WithResponse),
            value: Mutex::new(Vec::new()),
            descriptors: def
                .descriptors
                .iter()
                .map(|d| DescriptorInner::from_def(def.uuid, d))
                .collect(),
        })
    }

    pub(crate) fn value(&self) -> Vec<u8> {
        self.value.lock().unwrap().clone()
    }

    /// Latest completed read or pushed notification wins.
    pub(crate) fn set_value(&self, value: &[u8]) {
        *self.value.lock().unwrap() = value.to_vec();
    }

    pub(crate) fn write_type(&self) -> WriteType {
        *self.write_type.lock().unwrap()
    }

    pub(crate) fn set_write_type(&self, write_type: WriteType) {
        *self.write_type.lock().unwrap() = write_type;
    }

    pub(crate) fn descriptor(&self, uuid: Uuid) -> Option<&Arc<DescriptorInner>> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    pub(crate) fn cccd(&self) -> Option<&Arc<DescriptorInner>> {
        self.descriptor(btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Characteristic {
        Characteristic {
            uuid: self.uuid,
            service_uuid: self.service_uuid,
            properties: self.properties,
            inner: Arc::downgrade(self),
        }
    }
}

/// A handle to a GATT characteristic discovered for the current session.
///
/// A handle is a UUID path plus a weak reference into the session's
/// discovered tree. It stays cheap to clone and to keep around, but any
/// disconnect invalidates it: value accessors return `None` and operations
/// taking the handle fail with
/// [`Disconnected`][crate::error::ErrorKind::Disconnected].
#[derive(Debug, Clone)]
pub struct Characteristic {
    uuid: Uuid,
    service_uuid: Uuid,
    properties: CharacteristicProperties,
    inner: Weak<CharacteristicInner>,
}

impl Characteristic {
    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The [`Uuid`] of the service this characteristic belongs to
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// The properties of this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write,
    /// notify, etc) the peer reported as permitted.
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// The write acknowledgement mode the next write will use, or `None`
    /// once the session that discovered this characteristic has
    /// disconnected.
    pub fn write_type(&self) -> Option<WriteType> {
        self.inner.upgrade().map(|inner| inner.write_type())
    }

    /// The most recent value for this characteristic (from a completed read
    /// or a notification, whichever came last), or `None` once the session
    /// has disconnected.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.upgrade().map(|inner| inner.value())
    }

    /// The descriptors discovered on this characteristic. Empty once the
    /// session has disconnected.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        match self.inner.upgrade() {
            Some(inner) => inner.descriptors.iter().map(|d| d.handle()).collect(),
            None => Vec::new(),
        }
    }

    /// Finds a descriptor by UUID.
    pub fn descriptor(&self, uuid: Uuid) -> Option<Descriptor> {
        self.inner.upgrade()?.descriptor(uuid).map(|d| d.handle())
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<CharacteristicInner>> {
        self.inner.upgrade()
    }
}
