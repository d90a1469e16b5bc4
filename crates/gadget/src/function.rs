//! Function hooks called by the composite framework
//!
//! A [`GadgetFunction`] is one instance of a session's function in one
//! configuration. The framework serializes its hooks; they may run in any
//! thread, alongside channel operations on the same session.

use crate::bind::{BoundFunction, OsDescriptors, bind_function};
use crate::error::{FfsError, Result};
use crate::hw::Controller;
use crate::session::{Core, Session, SessionState};
use crate::sync::lock;
use protocol::{Direction, EventType, Recipient, SetupPacket, SpeedVariant, UsbSpeed};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What the framework does after [`GadgetFunction::setup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// No data stage; the status stage completes when userspace answers
    DelayedStatus,
    /// Userspace serves the data stage through the control channel
    DataStage,
}

pub struct GadgetFunction {
    session: Arc<Session>,
    bound: Mutex<Option<Arc<BoundFunction>>>,
}

impl std::fmt::Debug for GadgetFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetFunction")
            .field("session", &self.session.name())
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl GadgetFunction {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            bound: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.bound).is_some()
    }

    fn bound_function(&self) -> Result<Arc<BoundFunction>> {
        lock(&self.bound).clone().ok_or(FfsError::DeviceGone)
    }

    /// Attach the function to `controller`
    ///
    /// Any failure leaves the function unbound with its claims released.
    pub fn bind(&self, controller: Arc<dyn Controller>) -> Result<()> {
        let mut bound = lock(&self.bound);
        if bound.is_some() {
            return Err(FfsError::Busy);
        }
        self.session.check_alive()?;
        self.session.bind_controller(&controller)?;

        let (table, strings) = {
            let core = lock(&self.session.core);
            (core.table.clone(), core.strings.clone())
        };
        let result = match table {
            Some(table) => bind_function(&table, &strings, controller.as_ref()),
            None => Err(FfsError::InvalidState(self.session.state())),
        };
        let function = match result {
            Ok(function) => function,
            Err(e) => {
                warn!("{}: bind failed: {}", self.session.name(), e);
                self.session.unbind_controller();
                return Err(e);
            }
        };
        *bound = Some(Arc::new(function));
        drop(bound);

        info!("{}: function bound", self.session.name());
        self.session.push_event(EventType::Bind);
        Ok(())
    }

    pub fn unbind(&self) {
        let Some(function) = lock(&self.bound).take() else {
            return;
        };
        {
            let mut core = lock(&self.session.core);
            if core
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &function))
            {
                core.active = None;
                disable_endpoints(&core, &function);
            }
        }
        info!("{}: function unbound", self.session.name());
        self.session.push_event(EventType::Unbind);
        self.session.unbind_controller();
    }

    /// Select alternate setting `alt` of `interface`, `None` disables
    pub fn set_alt(&self, interface: u16, alt: Option<u8>) -> Result<()> {
        let function = self.bound_function()?;
        if alt.is_some() && function.revmap_intf(interface).is_none() {
            return Err(FfsError::OutOfRange);
        }

        let session = &self.session;
        let mut core = lock(&session.core);
        if let Some(active) = core.active.take() {
            disable_endpoints(&core, &active);
        }
        match core.state {
            SessionState::Active => {}
            SessionState::Deactivated => {
                core.state = SessionState::Closing;
                drop(core);
                self.schedule_reset();
                return Err(FfsError::DeviceGone);
            }
            _ => return Err(FfsError::DeviceGone),
        }

        if alt.is_none() {
            drop(core);
            debug!("{}: endpoints disabled", session.name());
            session.push_event(EventType::Disable);
            return Ok(());
        }

        let speed = core
            .controller
            .as_ref()
            .map(|c| c.speed())
            .ok_or(FfsError::DeviceGone)?;
        enable_endpoints(&core, &function, speed)?;
        core.active = Some(function);
        drop(core);

        debug!("{}: endpoints enabled at {:?}", session.name(), speed);
        session.push_event(EventType::Enable);
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        self.set_alt(0, None)
    }

    fn schedule_reset(&self) {
        let session = self.session.clone();
        match self.session.env.work.reserve() {
            Ok(permit) => permit.submit_or_run(Box::new(move || session.reset())),
            Err(e) => {
                debug!("{}: resetting inline: {}", self.session.name(), e);
                session.reset();
            }
        }
    }

    /// Hand a control request to userspace
    ///
    /// `wIndex` is rewritten to the function's logical numbering before the
    /// request is queued as a SETUP event.
    pub fn setup(&self, packet: &SetupPacket) -> Result<SetupOutcome> {
        let session = &self.session;
        session.check_alive()?;
        if session.state() != SessionState::Active {
            return Err(FfsError::DeviceGone);
        }
        let function = self.bound_function()?;

        let index = match packet.recipient() {
            Recipient::Interface => function
                .revmap_intf(packet.index)
                .ok_or(FfsError::OutOfRange)?,
            Recipient::Endpoint => {
                let slot = function
                    .revmap_ep(packet.index)
                    .ok_or(FfsError::OutOfRange)?;
                if function.virtual_addressing() {
                    usize::from(function.declared_address(slot).ok_or(FfsError::OutOfRange)?)
                } else {
                    slot
                }
            }
            Recipient::Device | Recipient::Other => return Err(FfsError::NotSupported),
        };

        let mut routed = *packet;
        routed.index = u16::try_from(index).map_err(|_| FfsError::OutOfRange)?;
        debug!(
            "{}: setup {:02x}/{:02x} index {} -> {}, {} bytes {:?}",
            session.name(),
            packet.request_type,
            packet.request,
            packet.index,
            routed.index,
            packet.length,
            packet.direction()
        );
        session.push_setup(routed);

        Ok(if packet.length == 0 {
            SetupOutcome::DelayedStatus
        } else {
            SetupOutcome::DataStage
        })
    }

    pub fn suspend(&self) {
        self.session.push_event(EventType::Suspend);
    }

    pub fn resume(&self) {
        self.session.push_event(EventType::Resume);
    }

    /// Rewritten descriptor records of one speed variant
    pub fn descriptors(&self, speed: SpeedVariant) -> Option<Vec<u8>> {
        lock(&self.bound).as_ref()?.descriptor_bytes(speed)
    }

    pub fn os_descriptors(&self) -> Option<OsDescriptors> {
        lock(&self.bound).as_ref()?.os_descriptors().cloned()
    }

    /// Hardware address claimed for endpoint `slot`
    pub fn endpoint_address(&self, slot: usize) -> Option<u8> {
        let bound = lock(&self.bound);
        let function = bound.as_ref()?;
        function.eps.get(slot.checked_sub(1)?).map(|ep| ep.num)
    }

    /// Configuration interface id of logical interface `logical`
    pub fn interface_number(&self, logical: usize) -> Option<u8> {
        lock(&self.bound).as_ref()?.interface_id(logical)
    }
}

impl Drop for GadgetFunction {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Enable every endpoint of `function` and bind its files
///
/// On failure the endpoints enabled so far are disabled again.
fn enable_endpoints(core: &Core, function: &BoundFunction, speed: UsbSpeed) -> Result<()> {
    for (n, ep) in function.eps.iter().enumerate() {
        let enabled = ep
            .descriptor_for(speed)
            .ok_or(FfsError::InvalidArgument("no descriptor for link speed"))
            .and_then(|desc| {
                ep.hw.enable(desc)?;
                Ok(desc)
            });
        let desc = match enabled {
            Ok(desc) => desc,
            Err(e) => {
                warn!("{}: enable failed: {}", ep.hw.name(), e);
                for file in core.epfiles.iter().take(n) {
                    file.unbind();
                    file.set_error();
                }
                for ep in &function.eps[..n] {
                    ep.hw.disable();
                    *lock(&ep.inflight) = None;
                }
                return Err(e);
            }
        };
        if let Some(file) = core.epfiles.get(n) {
            file.bind(
                ep.clone(),
                desc.direction() == Direction::In,
                desc.is_isochronous(),
            );
        }
    }
    Ok(())
}

/// Disable every endpoint of `function` and fail its files' pending I/O
fn disable_endpoints(core: &Core, function: &BoundFunction) {
    for file in &core.epfiles {
        file.unbind();
        file.set_error();
    }
    for ep in &function.eps {
        ep.hw.disable();
        *lock(&ep.inflight) = None;
    }
}
