use std::sync::Arc;

use uuid::Uuid;

use crate::characteristic::CharacteristicInner;
use crate::descriptor::DescriptorInner;
use crate::platform::GattLink;
use crate::service::{Service, ServiceInner};

/// The lifecycle state of the mediator's peripheral session.
///
/// A session only ever moves forward along
/// `Disconnected → Connecting → Connected → Discovering → Ready` within one
/// connection attempt; any teardown path drops it straight back to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// No session. The only state from which a connect is accepted.
    Disconnected,
    /// The platform accepted a connection attempt; the link is not up yet.
    Connecting,
    /// The link is up; service discovery has not started yet.
    Connected,
    /// Service discovery is in flight.
    Discovering,
    /// Discovery finished; GATT operations are accepted.
    Ready,
    /// A disconnect was requested; waiting for the platform to confirm.
    TearingDown,
}

/// The one session the mediator owns: state, peer identity, the platform
/// link handle, and the discovered tree.
///
/// Field invariants: `link` is present iff `state != Disconnected`;
/// `services` is populated exactly while `state == Ready`.
pub(crate) struct Session {
    state: SessionState,
    address: Option<String>,
    link: Option<Arc<dyn GattLink>>,
    services: Vec<Arc<ServiceInner>>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            state: SessionState::Disconnected,
            address: None,
            link: None,
            services: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn peer_address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub(crate) fn link(&self) -> Option<&Arc<dyn GattLink>> {
        self.link.as_ref()
    }

    /// Disconnected → Connecting. The address sticks around after teardown
    /// for diagnostics, so it is overwritten rather than cleared.
    pub(crate) fn begin_connect(&mut self, address: &str, link: Arc<dyn GattLink>) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        self.state = SessionState::Connecting;
        self.address = Some(address.to_owned());
        self.link = Some(link);
        true
    }

    /// Connecting → Connected.
    pub(crate) fn mark_link_up(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::Connected;
        true
    }

    /// Connected → Discovering.
    pub(crate) fn mark_discovering(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }
        self.state = SessionState::Discovering;
        true
    }

    /// Discovering → Ready, installing the discovered tree.
    pub(crate) fn install_services(&mut self, services: Vec<Arc<ServiceInner>>) -> bool {
        if self.state != SessionState::Discovering {
            return false;
        }
        self.state = SessionState::Ready;
        self.services = services;
        true
    }

    /// Any live state → TearingDown. False from Disconnected (nothing to
    /// tear down) and from TearingDown (already in progress).
    pub(crate) fn begin_teardown(&mut self) -> bool {
        match self.state {
            SessionState::Disconnected | SessionState::TearingDown => false,
            _ => {
                self.state = SessionState::TearingDown;
                true
            }
        }
    }

    /// Any state → Disconnected. Clears the tree (invalidating every
    /// outstanding handle) and yields the link handle, which the caller must
    /// close. Returns `None` when there was no session, so the handle can
    /// only ever be closed once.
    pub(crate) fn finish_teardown(&mut self) -> Option<Arc<dyn GattLink>> {
        self.state = SessionState::Disconnected;
        self.services = Vec::new();
        self.link.take()
    }

    pub(crate) fn service_handles(&self) -> Vec<Service> {
        self.services.iter().map(|s| s.handle()).collect()
    }

    pub(crate) fn find_service(&self, uuid: Uuid) -> Option<&Arc<ServiceInner>> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub(crate) fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<Arc<CharacteristicInner>> {
        self.find_service(service)?.characteristic(characteristic).cloned()
    }

    pub(crate) fn find_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Option<Arc<DescriptorInner>> {
        self.find_characteristic(service, characteristic)?
            .descriptor(descriptor)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::bluetooth_uuid_from_u16;
    use crate::mock::MockAdapter;
    use crate::platform::{Adapter, ServiceDef};

    fn connected_link() -> Arc<dyn GattLink> {
        let mock = MockAdapter::new();
        mock.add_peer("AA:BB:CC:DD:EE:FF", Vec::new());
        let peer = mock.remote_device("AA:BB:CC:DD:EE:FF").unwrap();
        peer.connect_gatt(Arc::new(crate::mock::NullCallbacks)).unwrap()
    }

    #[test]
    fn happy_path_lattice() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert!(session.begin_connect("AA:BB:CC:DD:EE:FF", connected_link()));
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.peer_address(), Some("AA:BB:CC:DD:EE:FF"));

        assert!(session.mark_link_up());
        assert!(session.mark_discovering());
        let tree = vec![ServiceInner::from_def(&ServiceDef::new(bluetooth_uuid_from_u16(0x180f)))];
        assert!(session.install_services(tree));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.service_handles().len(), 1);
    }

    #[test]
    fn no_state_skipping() {
        let mut session = Session::new();

        // nothing moves before a connect
        assert!(!session.mark_link_up());
        assert!(!session.mark_discovering());
        assert!(!session.install_services(Vec::new()));
        assert!(!session.begin_teardown());

        assert!(session.begin_connect("AA:BB:CC:DD:EE:FF", connected_link()));
        // cannot jump over Connected
        assert!(!session.mark_discovering());
        assert!(!session.install_services(Vec::new()));
        // double connect is rejected
        assert!(!session.begin_connect("11:22:33:44:55:66", connected_link()));
    }

    #[test]
    fn teardown_yields_link_exactly_once() {
        let mut session = Session::new();
        assert!(session.begin_connect("AA:BB:CC:DD:EE:FF", connected_link()));
        assert!(session.mark_link_up());

        assert!(session.begin_teardown());
        assert!(!session.begin_teardown());

        assert!(session.finish_teardown().is_some());
        assert!(session.finish_teardown().is_none());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.service_handles().is_empty());
        // address survives for diagnostics
        assert_eq!(session.peer_address(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn teardown_invalidates_handles() {
        let mut session = Session::new();
        assert!(session.begin_connect("AA:BB:CC:DD:EE:FF", connected_link()));
        assert!(session.mark_link_up());
        assert!(session.mark_discovering());

        let def = ServiceDef::new(bluetooth_uuid_from_u16(0x180f));
        assert!(session.install_services(vec![ServiceInner::from_def(&def)]));
        let handle = session.service_handles().remove(0);

        session.finish_teardown();
        assert!(handle.characteristics().is_empty());
    }
}
