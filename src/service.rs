use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicInner};
use crate::platform::ServiceDef;

pub(crate) struct ServiceInner {
    pub(crate) uuid: Uuid,
    pub(crate) characteristics: Vec<Arc<CharacteristicInner>>,
}

impl ServiceInner {
    pub(crate) fn from_def(def: &ServiceDef) -> Arc<Self> {
        Arc::new(ServiceInner {
            uuid: def.uuid,
            characteristics: def
                .characteristics
                .iter()
                .map(|c| CharacteristicInner::from_def(def.uuid, c))
                .collect(),
        })
    }

    pub(crate) fn characteristic(&self, uuid: Uuid) -> Option<&Arc<CharacteristicInner>> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Service {
        Service {
            uuid: self.uuid,
            inner: Arc::downgrade(self),
        }
    }
}

/// A handle to a GATT service discovered for the current session.
///
/// Like the other tree handles, a `Service` is invalidated by any disconnect;
/// its lookup methods then come back empty.
#[derive(Debug, Clone)]
pub struct Service {
    uuid: Uuid,
    inner: Weak<ServiceInner>,
}

impl Service {
    /// The [`Uuid`] identifying the type of this GATT service
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The characteristics discovered on this service. Empty once the
    /// session has disconnected.
    pub fn characteristics(&self) -> Vec<Characteristic> {
        match self.inner.upgrade() {
            Some(inner) => inner.characteristics.iter().map(|c| c.handle()).collect(),
            None => Vec::new(),
        }
    }

    /// Finds a characteristic by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.inner.upgrade()?.characteristic(uuid).map(|c| c.handle())
    }
}
