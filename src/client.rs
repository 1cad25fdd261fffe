use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicInner};
use crate::descriptor::cccd;
use crate::dispatch::{Dispatcher, Event, Subscription};
use crate::error::{check_status, Error, ErrorKind};
use crate::ops::{OpKind, OpSlot};
use crate::platform::{self, GattCallbacks, GattLink, LinkState};
use crate::service::{Service, ServiceInner};
use crate::session::{Session, SessionState};
use crate::{Result, WriteType};

/// Tunables for a [`GattClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The longest a serialized operation may wait, admission and completion
    /// together, before failing with
    /// [`TimedOut`][crate::error::ErrorKind::TimedOut]. `None` waits
    /// indefinitely, which reproduces the behavior of stacks that never
    /// bound their callback waits; the default of five seconds is the safer
    /// choice against peripherals that simply stop answering.
    pub operation_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            operation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// A blocking GATT client mediating one peripheral session at a time.
///
/// `GattClient` is cheap to clone; clones share the same session. All
/// methods may be called from any thread. The client talks to the platform
/// stack through the [`platform::Adapter`] it was created with and never
/// holds more than one GATT operation outstanding against it.
///
/// Dropping the last clone closes the session as if by
/// [`close`][GattClient::close].
#[derive(Clone)]
pub struct GattClient {
    shared: Arc<Shared>,
    callbacks: Arc<ClientCallbacks>,
}

struct Shared {
    adapter: Arc<dyn platform::Adapter>,
    config: ClientConfig,
    session: Mutex<Session>,
    slot: OpSlot,
    dispatcher: Dispatcher,
}

impl GattClient {
    /// Creates a client over `adapter` with the default configuration.
    pub fn new(adapter: Arc<dyn platform::Adapter>) -> Self {
        Self::with_config(adapter, ClientConfig::default())
    }

    /// Creates a client over `adapter` with an explicit configuration.
    pub fn with_config(adapter: Arc<dyn platform::Adapter>, config: ClientConfig) -> Self {
        let shared = Arc::new(Shared {
            adapter,
            config,
            session: Mutex::new(Session::new()),
            slot: OpSlot::new(),
            dispatcher: Dispatcher::new(),
        });
        let callbacks = Arc::new(ClientCallbacks {
            shared: Arc::downgrade(&shared),
        });
        GattClient { shared, callbacks }
    }

    /// Subscribes to session events. Every subscription sees every event
    /// published after it was created, in publish order; dropping it
    /// unsubscribes.
    pub fn events(&self) -> Subscription {
        self.shared.dispatcher.subscribe()
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        self.shared.session.lock().unwrap().state()
    }

    /// The address of the current (or most recent) peer.
    pub fn peer_address(&self) -> Option<String> {
        self.shared.session.lock().unwrap().peer_address().map(str::to_owned)
    }

    /// The services discovered for the current session. Empty unless the
    /// session is [`Ready`][SessionState::Ready].
    pub fn services(&self) -> Vec<Service> {
        self.shared.session.lock().unwrap().service_handles()
    }

    /// Finds a discovered service by UUID.
    pub fn service(&self, uuid: Uuid) -> Option<Service> {
        self.shared.session.lock().unwrap().find_service(uuid).map(|s| s.handle())
    }

    /// Starts a connection attempt to the peripheral at `address`.
    ///
    /// Returns as soon as the platform accepts the attempt; the link coming
    /// up is reported as [`Event::Connected`], after which service discovery
    /// runs implicitly and [`Event::ServicesDiscovered`] marks the session
    /// [`Ready`][SessionState::Ready].
    ///
    /// Errors: [`NotInitialized`][ErrorKind::NotInitialized] when the
    /// adapter is missing or disabled, [`Busy`][ErrorKind::Busy] when a
    /// session already exists in any state,
    /// [`InvalidAddress`][ErrorKind::InvalidAddress] when `address` is empty
    /// or unknown to the stack. A failed precondition leaves no trace: no
    /// state change and no platform call.
    pub fn connect(&self, address: &str) -> Result<()> {
        if !self.shared.adapter.is_enabled() {
            return Err(Error::new(
                ErrorKind::NotInitialized,
                None,
                "bluetooth adapter is not enabled",
            ));
        }
        let mut session = self.shared.session.lock().unwrap();
        if session.state() != SessionState::Disconnected {
            return Err(Error::new(
                ErrorKind::Busy,
                None,
                format!("connect attempted in state {:?}", session.state()),
            ));
        }
        if address.is_empty() {
            return Err(Error::new(ErrorKind::InvalidAddress, None, "empty peer address"));
        }
        let Some(peer) = self.shared.adapter.remote_device(address) else {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                None,
                format!("device {address} not found"),
            ));
        };
        let link = peer.connect_gatt(self.callbacks.clone() as Arc<dyn GattCallbacks>)?;
        session.begin_connect(address, link);
        info!(%address, "connection attempt started");
        Ok(())
    }

    /// Requests an orderly teardown of the current session.
    ///
    /// Returns immediately; the actual teardown happens when the platform
    /// reports the link down, at which point blocked operations wake with
    /// [`Disconnected`][ErrorKind::Disconnected] and subscribers see
    /// [`Event::Disconnected`]. Calling this with no session, or while a
    /// teardown is already in flight, is a no-op.
    pub fn disconnect(&self) {
        let mut session = self.shared.session.lock().unwrap();
        if !session.begin_teardown() {
            debug!(state = ?session.state(), "disconnect with nothing to tear down");
            return;
        }
        if let Some(link) = session.link() {
            link.disconnect();
        }
        info!("disconnect requested");
    }

    /// Tears the session down unconditionally and releases the platform
    /// handle.
    ///
    /// The handle is closed exactly once no matter how often this is
    /// called; [`Event::Disconnected`] is published only on the call that
    /// actually ends a session. Safe to call at any time, including with no
    /// session at all.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Writes `value` to a characteristic and blocks until the platform
    /// reports the write complete.
    ///
    /// With `verify` the write is submitted as an acknowledged ATT Write
    /// Request; otherwise as an unacknowledged Write Command. Either way a
    /// non-success completion status is surfaced as
    /// [`Protocol`][ErrorKind::Protocol].
    ///
    /// Errors: [`Disconnected`][ErrorKind::Disconnected] (no ready session,
    /// stale handle, or teardown while blocked),
    /// [`TimedOut`][ErrorKind::TimedOut],
    /// [`Rejected`][ErrorKind::Rejected] when the platform refuses the
    /// submission.
    pub fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        verify: bool,
    ) -> Result<()> {
        let (inner, link) = self.resolve(characteristic)?;
        let write_type = if verify {
            WriteType::WithResponse
        } else {
            WriteType::NoResponse
        };
        inner.set_write_type(write_type);

        let deadline = self.deadline();
        let guard = self
            .shared
            .slot
            .acquire(OpKind::WriteCharacteristic, inner.uuid, deadline)?;
        if !link.write_characteristic(inner.service_uuid, inner.uuid, value, write_type) {
            return Err(self.submit_refused("characteristic write"));
        }
        debug!(characteristic = %inner.uuid, len = value.len(), ?write_type, "write submitted");
        let status = guard.wait_done(deadline)?;
        check_status(status)
    }

    /// Writes a UTF-8 string to a characteristic as an acknowledged write,
    /// returning at submission instead of waiting for the completion
    /// callback.
    ///
    /// The operation still occupies the serializer slot until its completion
    /// arrives, so it cannot interleave with other operations; only the
    /// caller is released early. Failures reported by the completion
    /// callback are logged, not returned.
    pub fn write_characteristic_str(&self, characteristic: &Characteristic, value: &str) -> Result<()> {
        let (inner, link) = self.resolve(characteristic)?;
        inner.set_write_type(WriteType::WithResponse);

        let guard = self
            .shared
            .slot
            .acquire(OpKind::WriteCharacteristic, inner.uuid, self.deadline())?;
        if !link.write_characteristic(
            inner.service_uuid,
            inner.uuid,
            value.as_bytes(),
            WriteType::WithResponse,
        ) {
            return Err(self.submit_refused("characteristic write"));
        }
        debug!(characteristic = %inner.uuid, len = value.len(), "string write submitted");
        guard.detach();
        Ok(())
    }

    /// Requests a read of a characteristic's value.
    ///
    /// Does not block: the value arrives through the completion callback,
    /// which updates [`Characteristic::value`] and publishes
    /// [`Event::DataAvailable`]. The read occupies the serializer slot until
    /// then.
    pub fn read_characteristic(&self, characteristic: &Characteristic) -> Result<()> {
        let (inner, link) = self.resolve(characteristic)?;
        let guard = self
            .shared
            .slot
            .acquire(OpKind::ReadCharacteristic, inner.uuid, self.deadline())?;
        if !link.read_characteristic(inner.service_uuid, inner.uuid) {
            return Err(self.submit_refused("characteristic read"));
        }
        debug!(characteristic = %inner.uuid, "read submitted");
        guard.detach();
        Ok(())
    }

    /// Enables or disables notifications for a characteristic and blocks
    /// until the peer's CCCD reads back the requested configuration.
    ///
    /// Enabling routes notifications locally and writes `{0x01, 0x00}` to
    /// the characteristic's client characteristic configuration descriptor;
    /// disabling writes `{0x00, 0x00}`. The call returns once the
    /// platform's read-back of the descriptor matches the written value.
    ///
    /// Errors: [`DescriptorNotFound`][ErrorKind::DescriptorNotFound] when
    /// the characteristic carries no CCCD, plus the blocking-operation
    /// errors of [`write_characteristic`][GattClient::write_characteristic].
    pub fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<()> {
        self.configure_subscription(characteristic, enabled, cccd::ENABLE_NOTIFICATION)
    }

    /// Enables or disables indications for a characteristic; the indication
    /// twin of
    /// [`set_characteristic_notification`][GattClient::set_characteristic_notification],
    /// writing `{0x02, 0x00}` to enable.
    pub fn set_characteristic_indication(
        &self,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<()> {
        self.configure_subscription(characteristic, enabled, cccd::ENABLE_INDICATION)
    }

    fn configure_subscription(
        &self,
        characteristic: &Characteristic,
        enabled: bool,
        enable_value: [u8; 2],
    ) -> Result<()> {
        let (inner, link) = self.resolve(characteristic)?;
        let Some(descriptor) = inner.cccd().cloned() else {
            return Err(Error::new(
                ErrorKind::DescriptorNotFound,
                None,
                format!("characteristic {} has no configuration descriptor", inner.uuid),
            ));
        };
        let target = if enabled { enable_value } else { cccd::DISABLE };

        let deadline = self.deadline();
        let guard = self
            .shared
            .slot
            .acquire(OpKind::WriteDescriptor, inner.uuid, deadline)?;
        if !link.set_characteristic_notification(inner.service_uuid, inner.uuid, enabled) {
            return Err(self.submit_refused("notification routing"));
        }
        if !link.write_descriptor(inner.service_uuid, inner.uuid, descriptor.uuid, &target) {
            return Err(self.submit_refused("descriptor write"));
        }
        debug!(characteristic = %inner.uuid, enabled, ?target, "configuration descriptor write submitted");
        guard.wait_value(deadline, || descriptor.value_equals(&target))
    }

    /// Resolves a handle to its live tree node and the session link.
    fn resolve(&self, characteristic: &Characteristic) -> Result<(Arc<CharacteristicInner>, Arc<dyn GattLink>)> {
        let session = self.shared.session.lock().unwrap();
        if session.state() != SessionState::Ready {
            return Err(Error::new(
                ErrorKind::Disconnected,
                None,
                format!("no ready session (state {:?})", session.state()),
            ));
        }
        let Some(inner) = characteristic.upgrade() else {
            return Err(Error::new(
                ErrorKind::Disconnected,
                None,
                "characteristic handle from an ended session",
            ));
        };
        let Some(link) = session.link().cloned() else {
            return Err(ErrorKind::Disconnected.into());
        };
        Ok((inner, link))
    }

    fn deadline(&self) -> Option<Instant> {
        self.shared.config.operation_timeout.map(|t| Instant::now() + t)
    }

    /// A refused submission during teardown is a disconnect from the
    /// caller's point of view, not a platform fault.
    fn submit_refused(&self, what: &str) -> Error {
        let state = self.shared.session.lock().unwrap().state();
        if state == SessionState::Ready {
            Error::new(ErrorKind::Rejected, None, format!("platform refused {what}"))
        } else {
            Error::new(
                ErrorKind::Disconnected,
                None,
                format!("{what} refused in state {state:?}"),
            )
        }
    }
}

impl Shared {
    fn close(&self) {
        // The handle is released under the session lock so a new connect
        // cannot interleave with the old link going away.
        let closed = {
            let mut session = self.session.lock().unwrap();
            match session.finish_teardown() {
                Some(link) => {
                    link.close();
                    true
                }
                None => false,
            }
        };
        if !closed {
            return;
        }
        self.slot.teardown();
        self.dispatcher.publish(Event::Disconnected);
        info!("session closed");
    }

    fn handle_link_up(&self, status: u8) {
        let mut session = self.session.lock().unwrap();
        if !session.mark_link_up() {
            debug!(state = ?session.state(), status, "ignoring stale connected callback");
            return;
        }
        info!(status, "connected to GATT server");
        self.dispatcher.publish(Event::Connected);

        let Some(link) = session.link().cloned() else {
            return;
        };
        session.mark_discovering();
        drop(session);
        if link.discover_services() {
            debug!("service discovery requested");
        } else {
            warn!("platform refused the service discovery request");
        }
    }

    fn handle_link_down(&self, status: u8) {
        let closed = {
            let mut session = self.session.lock().unwrap();
            match session.finish_teardown() {
                Some(link) => {
                    link.close();
                    true
                }
                None => false,
            }
        };
        if !closed {
            debug!(status, "ignoring disconnect callback with no session");
            return;
        }
        info!(status, "disconnected from GATT server");
        self.slot.teardown();
        self.dispatcher.publish(Event::Disconnected);
    }

    fn handle_services_discovered(&self, status: u8) {
        if let Err(err) = check_status(status) {
            // Stay in Discovering: the session is still up, it just has no
            // usable tree. A retry would be a new discover request.
            warn!(%err, "service discovery failed");
            return;
        }
        let mut session = self.session.lock().unwrap();
        if session.state() != SessionState::Discovering {
            debug!(state = ?session.state(), "ignoring stale discovery callback");
            return;
        }
        let Some(link) = session.link().cloned() else {
            return;
        };
        let tree: Vec<Arc<ServiceInner>> = link.services().iter().map(ServiceInner::from_def).collect();
        info!(services = tree.len(), "service discovery complete");
        session.install_services(tree);
        let handles = session.service_handles();
        drop(session);
        self.dispatcher.publish(Event::ServicesDiscovered(handles));
    }

    fn handle_characteristic_read(&self, service: Uuid, characteristic: Uuid, value: &[u8], status: u8) {
        let inner = {
            self.session
                .lock()
                .unwrap()
                .find_characteristic(service, characteristic)
        };
        let ok = check_status(status).is_ok();
        if ok {
            if let Some(inner) = &inner {
                inner.set_value(value);
            }
        } else {
            warn!(%characteristic, status, "characteristic read failed");
        }
        self.slot.complete(OpKind::ReadCharacteristic, characteristic, status);
        if ok && inner.is_some() {
            self.dispatcher.publish(Event::DataAvailable {
                characteristic,
                value: value.to_vec(),
            });
        }
    }

    fn handle_characteristic_write(&self, characteristic: Uuid, status: u8) {
        if status != 0 {
            warn!(%characteristic, status, "characteristic write failed");
        }
        self.slot.complete(OpKind::WriteCharacteristic, characteristic, status);
    }

    fn handle_descriptor_write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
        status: u8,
    ) {
        let desc = {
            self.session
                .lock()
                .unwrap()
                .find_descriptor(service, characteristic, descriptor)
        };
        // Write the read-back into the tree before signaling, so a woken
        // waiter observes it.
        match desc {
            Some(desc) => desc.set_value(value),
            None => debug!(%descriptor, "descriptor write completion for unknown descriptor"),
        }
        self.slot.complete(OpKind::WriteDescriptor, characteristic, status);
    }

    fn handle_characteristic_changed(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let inner = {
            self.session
                .lock()
                .unwrap()
                .find_characteristic(service, characteristic)
        };
        let Some(inner) = inner else {
            debug!(%characteristic, "notification for unknown characteristic");
            return;
        };
        inner.set_value(value);
        self.dispatcher.publish(Event::DataAvailable {
            characteristic,
            value: value.to_vec(),
        });
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// The callback sink handed to the platform. It holds the client weakly so
/// a platform stack that outlives the client cannot keep the session alive,
/// and late callbacks fall through harmlessly.
struct ClientCallbacks {
    shared: Weak<Shared>,
}

impl GattCallbacks for ClientCallbacks {
    fn on_connection_state_change(&self, state: LinkState, status: u8) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match state {
            LinkState::Connected => shared.handle_link_up(status),
            LinkState::Disconnected => shared.handle_link_down(status),
        }
    }

    fn on_services_discovered(&self, status: u8) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_services_discovered(status);
    }

    fn on_characteristic_read(&self, service: Uuid, characteristic: Uuid, value: &[u8], status: u8) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_characteristic_read(service, characteristic, value, status);
    }

    fn on_characteristic_write(&self, _service: Uuid, characteristic: Uuid, status: u8) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_characteristic_write(characteristic, status);
    }

    fn on_descriptor_write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
        status: u8,
    ) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_descriptor_write(service, characteristic, descriptor, value, status);
    }

    fn on_characteristic_changed(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_characteristic_changed(service, characteristic, value);
    }
}
