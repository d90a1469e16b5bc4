//! Control channel
//!
//! While collecting, writes carry the descriptor and string uploads. Once
//! active, reads return control events and both directions serve the data
//! stage of the delivered control request.

use crate::error::{FfsError, Result};
use crate::events::SetupState;
use crate::hw::{HwEndpoint, HwRequest};
use crate::session::{Session, SessionState};
use crate::sync::{Interrupt, Transfer, Wake, Waiter, lock, wait_until};
use protocol::{
    ControlEvent, Direction, EVENT_SIZE, MIN_UPLOAD_LEN, ProtocolError, parse_descriptors,
    parse_strings,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Readiness reported by [`ControlChannel::poll`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

enum Incoming {
    Events(Vec<ControlEvent>),
    Data(Vec<u8>),
}

/// Open handle on a session's control channel
///
/// Dropping the handle closes it.
pub struct ControlChannel {
    session: Arc<Session>,
    waiter: Waiter,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("session", &self.session.name())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Open the control channel of `session`
    ///
    /// Only one handle may be open, and none while the session closes. The
    /// first open of a deactivated session resets it.
    pub(crate) fn open(session: Arc<Session>, waiter: Waiter) -> Result<Self> {
        session.check_alive()?;
        let mut core = lock(&session.core);
        if core.state == SessionState::Closing || core.opened > 0 {
            return Err(FfsError::Busy);
        }
        core.opened += 1;
        let deactivated = core.state == SessionState::Deactivated;
        if deactivated {
            core.state = SessionState::Closing;
        }
        drop(core);
        if deactivated {
            session.reset();
        }
        debug!("{}: control channel opened", session.name());
        Ok(Self { session, waiter })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn set_nonblocking(&mut self, nonblock: bool) {
        self.waiter.nonblock = nonblock;
    }

    pub fn set_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.waiter.timeout = timeout;
    }

    /// Token that interrupts this handle's blocking calls
    pub fn interrupt(&self) -> Interrupt {
        self.waiter.interrupt.clone()
    }

    /// Report and clear a superseded request
    fn fast_check(&self) -> Result<()> {
        self.session.check_alive()?;
        if lock(&self.session.events).clear_cancelled() == SetupState::Cancelled {
            return Err(FfsError::Withdrawn);
        }
        Ok(())
    }

    /// Write an upload or the IN data stage of the delivered request
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.fast_check()?;
        let session = self.session.clone();
        let op = session.op.acquire(&self.waiter, session.tick())?;

        match session.state() {
            SessionState::CollectingDescriptors => {
                check_upload_len(data)?;
                accept_descriptors(&session, data)?;
                Ok(data.len())
            }
            SessionState::CollectingStrings => {
                check_upload_len(data)?;
                accept_strings(&session, data)?;
                drop(op);
                announce_ready(&session)?;
                Ok(data.len())
            }
            SessionState::Active => self.respond(data),
            other => Err(FfsError::InvalidState(other)),
        }
    }

    fn respond(&self, data: &[u8]) -> Result<usize> {
        let session = &self.session;
        let (ep0, len, zero) = {
            let core = lock(&session.core);
            let mut events = lock(&session.events);
            match events.clear_cancelled() {
                SetupState::Cancelled => return Err(FfsError::Withdrawn),
                SetupState::Pending { delivered: true } => {}
                _ => return Err(FfsError::NoPendingRequest),
            }
            let setup = events.setup();
            if setup.direction() != Direction::In {
                return Err(session.stall(&core, &mut events));
            }
            let ep0 = core
                .controller
                .as_ref()
                .map(|c| c.ep0())
                .ok_or(FfsError::DeviceGone)?;
            let wanted = usize::from(setup.length);
            let len = data.len().min(wanted);
            (ep0, len, len < wanted)
        };
        let (_, n) = self.data_stage(ep0, data[..len].to_vec(), len, zero)?;
        Ok(n)
    }

    /// Read events (or OUT data-stage bytes) into `buf`
    ///
    /// Events are encoded as 12-byte records; the return value is the
    /// number of bytes filled.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read_inner(buf.len() / EVENT_SIZE, buf.len(), true)? {
            Incoming::Events(events) => {
                for (chunk, event) in buf.chunks_exact_mut(EVENT_SIZE).zip(&events) {
                    chunk.copy_from_slice(&event.to_bytes());
                }
                Ok(events.len() * EVENT_SIZE)
            }
            Incoming::Data(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }

    /// Read up to `max` events
    pub fn read_events(&mut self, max: usize) -> Result<Vec<ControlEvent>> {
        match self.read_inner(max, 0, false)? {
            Incoming::Events(events) => Ok(events),
            Incoming::Data(_) => Err(FfsError::InvalidArgument("data stage pending")),
        }
    }

    /// Read the OUT data stage of the delivered request
    pub fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        match self.read_inner(0, len, true)? {
            Incoming::Data(data) => Ok(data),
            Incoming::Events(_) => Err(FfsError::NoPendingRequest),
        }
    }

    fn read_inner(&mut self, max_events: usize, data_len: usize, allow_data: bool) -> Result<Incoming> {
        self.fast_check()?;
        let session = self.session.clone();
        let _op = session.op.acquire(&self.waiter, session.tick())?;

        let core = lock(&session.core);
        if core.state != SessionState::Active {
            return Err(FfsError::InvalidState(core.state));
        }
        let mut events = lock(&session.events);
        match events.clear_cancelled() {
            SetupState::Cancelled => Err(FfsError::Withdrawn),
            SetupState::Pending { delivered: true } => {
                if !allow_data {
                    return Err(FfsError::InvalidArgument("data stage pending"));
                }
                let setup = events.setup();
                if setup.direction() == Direction::In {
                    return Err(session.stall(&core, &mut events));
                }
                let ep0 = core
                    .controller
                    .as_ref()
                    .map(|c| c.ep0())
                    .ok_or(FfsError::DeviceGone)?;
                let len = data_len.min(usize::from(setup.length));
                drop(events);
                drop(core);

                let (mut buf, n) = self.data_stage(ep0, vec![0; len], len, false)?;
                buf.truncate(n.min(len));
                Ok(Incoming::Data(buf))
            }
            SetupState::NoSetup | SetupState::Pending { delivered: false } => {
                drop(core);
                if max_events == 0 {
                    return Err(FfsError::InvalidArgument("buffer shorter than one event"));
                }
                if self.waiter.nonblock && events.is_empty() {
                    return Err(FfsError::WouldBlock);
                }
                let (mut events, wake) = wait_until(
                    &session.events_cond,
                    events,
                    &self.waiter,
                    session.tick(),
                    |queue| !queue.is_empty() || !session.is_alive(),
                );
                if wake == Wake::Interrupted {
                    return Err(FfsError::Interrupted);
                }
                session.check_alive()?;
                let delivered = events.pop(max_events);
                debug!("{}: delivered {} events", session.name(), delivered.len());
                Ok(Incoming::Events(delivered))
            }
        }
    }

    /// Queue one ep0 request and wait for it
    fn data_stage(
        &self,
        ep0: Arc<dyn HwEndpoint>,
        buf: Vec<u8>,
        length: usize,
        zero: bool,
    ) -> Result<(Vec<u8>, usize)> {
        let session = &self.session;
        let transfer = Transfer::new();
        let id = ep0
            .queue(HwRequest {
                buf,
                length,
                zero,
                complete: transfer.completion(),
            })
            .map_err(FfsError::Hardware)?;

        let Some((buf, status)) = transfer.wait(&self.waiter, session.tick()) else {
            if let Err(e) = ep0.dequeue(id) {
                debug!("{}: ep0 dequeue after interrupt: {}", session.name(), e);
            }
            return Err(FfsError::Interrupted);
        };

        let mut events = lock(&session.events);
        let cancelled = events.setup_state() == SetupState::Cancelled;
        match (cancelled, status) {
            (true, Err(e)) => {
                debug!("{}: data stage of withdrawn request failed: {}", session.name(), e);
                events.clear_cancelled();
                Err(FfsError::Withdrawn)
            }
            (true, Ok(n)) => Ok((buf, n)),
            (false, status) => {
                events.finish_setup();
                Ok((buf, status?))
            }
        }
    }

    /// Current readiness of the channel
    pub fn poll(&self) -> Readiness {
        let core = lock(&self.session.core);
        let events = lock(&self.session.events);
        match core.state {
            SessionState::CollectingDescriptors | SessionState::CollectingStrings => Readiness {
                readable: false,
                writable: true,
            },
            SessionState::Active => match events.setup_state() {
                SetupState::NoSetup | SetupState::Pending { delivered: false } => Readiness {
                    readable: !events.is_empty(),
                    writable: false,
                },
                SetupState::Pending { delivered: true } | SetupState::Cancelled => Readiness {
                    readable: true,
                    writable: true,
                },
            },
            SessionState::Deactivated | SessionState::Closing => Readiness::default(),
        }
    }

    /// Logical interface number of configuration interface `interface`
    pub fn interface_revmap(&self, interface: u16) -> Result<usize> {
        self.session.check_alive()?;
        let core = lock(&self.session.core);
        let function = core.active.as_ref().ok_or(FfsError::DeviceGone)?;
        function.revmap_intf(interface).ok_or(FfsError::OutOfRange)
    }

    /// Pass a control operation to the controller
    pub fn controller_ioctl(&self, code: u32, value: u64) -> Result<u64> {
        self.session.check_alive()?;
        let controller = lock(&self.session.core).controller.clone();
        match controller {
            Some(controller) => controller.ioctl(code, value),
            None => Err(FfsError::NotSupported),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        debug!("{}: control channel closed", self.session.name());
        self.session.handle_closed();
    }
}

fn check_upload_len(data: &[u8]) -> Result<()> {
    if data.len() < MIN_UPLOAD_LEN {
        return Err(ProtocolError::Truncated {
            what: "upload",
            needed: MIN_UPLOAD_LEN,
            available: data.len(),
        }
        .into());
    }
    Ok(())
}

fn accept_descriptors(session: &Session, data: &[u8]) -> Result<()> {
    let table = parse_descriptors(data).inspect_err(|e| {
        warn!("{}: descriptor upload rejected: {}", session.name(), e);
    })?;
    let notifier = match table.notify_handle {
        Some(handle) => Some(session.env.host.resolve_notifier(handle)?),
        None => None,
    };
    info!(
        "{}: descriptors accepted: {} interfaces, {} endpoints, {} strings",
        session.name(),
        table.interfaces_count,
        table.eps_count,
        table.strings_count
    );
    session.set_notifier(notifier);

    let mut core = lock(&session.core);
    core.table = Some(Arc::new(table));
    core.state = SessionState::CollectingStrings;
    Ok(())
}

fn accept_strings(session: &Session, data: &[u8]) -> Result<()> {
    let mut core = lock(&session.core);
    let needed = core.table.as_ref().map_or(0, |t| t.strings_count);
    let strings = parse_strings(data, needed).inspect_err(|e| {
        warn!("{}: string upload rejected: {}", session.name(), e);
    })?;
    core.strings = strings;

    if let Err(e) = session.create_epfiles(&mut core) {
        core.state = SessionState::Closing;
        return Err(e);
    }
    core.state = SessionState::Active;
    info!(
        "{}: active with {} endpoint files",
        session.name(),
        core.epfiles.len()
    );
    Ok(())
}

/// Tell the binder the function is usable
fn announce_ready(session: &Arc<Session>) -> Result<()> {
    let Some(binder) = session.env.binder.clone() else {
        return Ok(());
    };
    match binder.ready(session) {
        Ok(()) => {
            lock(&session.core).ready_called = true;
            Ok(())
        }
        Err(e) => {
            warn!("{}: binder refused ready: {}", session.name(), e);
            lock(&session.core).state = SessionState::Closing;
            Err(e)
        }
    }
}
