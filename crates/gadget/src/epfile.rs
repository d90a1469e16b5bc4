//! Endpoint files and their synchronous I/O path
//!
//! An [`EpFile`] exists for every declared endpoint slot while the session
//! is active. It is bound to a hardware endpoint only while the function's
//! endpoints are enabled; every bind and unbind bumps its generation so an
//! I/O that slept across a change can tell.

use crate::bind::{InFlight, LiveEndpoint};
use crate::error::{FfsError, HwError, Result};
use crate::hw::{HwRequest, HwStatus, RequestId};
use crate::session::{Session, SessionState};
use crate::sync::{Interrupt, OpLock, Transfer, Wake, Waiter, lock, wait_until};
use protocol::EndpointDescriptor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, trace, warn};

/// Hardware endpoint an endpoint file is currently bound to
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) ep: Arc<LiveEndpoint>,
    /// Device-to-host endpoint
    pub(crate) is_in: bool,
    pub(crate) isoc: bool,
}

#[derive(Default)]
struct FileState {
    binding: Option<Binding>,
    generation: u64,
}

pub(crate) struct EpFile {
    name: String,
    slot: usize,
    opened: AtomicBool,
    error: AtomicBool,
    removed: AtomicBool,
    /// Serializes synchronous transfers on this file
    pub(crate) io: OpLock,
    state: Mutex<FileState>,
    cond: Condvar,
}

impl EpFile {
    pub(crate) fn new(name: String, slot: usize) -> Self {
        Self {
            name,
            slot,
            opened: AtomicBool::new(false),
            error: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            io: OpLock::default(),
            state: Mutex::new(FileState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(FfsError::Busy);
        }
        self.error.store(false, Ordering::Release);
        Ok(())
    }

    fn release(&self) {
        self.opened.store(false, Ordering::Release);
        self.set_error();
    }

    pub(crate) fn set_error(&self) {
        self.error.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    fn clear_error(&self) {
        self.error.store(false, Ordering::Release);
    }

    fn is_errored(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Session tore the file down
    pub(crate) fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        self.unbind();
        self.set_error();
    }

    pub(crate) fn bind(&self, ep: Arc<LiveEndpoint>, is_in: bool, isoc: bool) {
        let mut state = lock(&self.state);
        state.binding = Some(Binding { ep, is_in, isoc });
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn unbind(&self) {
        let mut state = lock(&self.state);
        state.binding = None;
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Wake waiters so they recheck the session
    pub(crate) fn wake(&self) {
        let _state = lock(&self.state);
        self.cond.notify_all();
    }

    pub(crate) fn current(&self) -> Option<(Binding, u64)> {
        let state = lock(&self.state);
        state.binding.clone().map(|b| (b, state.generation))
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = lock(&self.state);
        state.binding.is_some() && state.generation == generation
    }
}

/// Open handle on an endpoint file
///
/// Dropping the handle releases the file.
pub struct EndpointChannel {
    pub(crate) session: Arc<Session>,
    pub(crate) file: Arc<EpFile>,
    pub(crate) waiter: Waiter,
    /// A read on this handle has completed successfully
    first_read_done: bool,
}

impl std::fmt::Debug for EndpointChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointChannel")
            .field("session", &self.session.name())
            .field("file", &self.file.name())
            .finish_non_exhaustive()
    }
}

impl EndpointChannel {
    pub(crate) fn new(session: Arc<Session>, file: Arc<EpFile>, waiter: Waiter) -> Self {
        Self {
            session,
            file,
            waiter,
            first_read_done: false,
        }
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// 1-based endpoint slot
    pub fn slot(&self) -> usize {
        self.file.slot()
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

    /// Wait until the file is bound to an enabled endpoint
    pub(crate) fn wait_for_endpoint(&self, read: bool) -> Result<(Binding, u64)> {
        loop {
            self.session.check_alive()?;
            if self.file.is_errored() {
                return Err(FfsError::DeviceGone);
            }
            if self.session.state() != SessionState::Active {
                return Err(FfsError::DeviceGone);
            }

            let state = lock(&self.file.state);
            if let Some(binding) = &state.binding {
                return Ok((binding.clone(), state.generation));
            }
            if self.waiter.nonblock {
                return Err(FfsError::WouldBlock);
            }
            if !read {
                return Err(FfsError::DeviceGone);
            }

            let file = &self.file;
            let session = &self.session;
            let (state, wake) = wait_until(
                &file.cond,
                state,
                &self.waiter,
                session.tick(),
                |s| s.binding.is_some() || file.is_errored() || !session.is_alive(),
            );
            if wake == Wake::Interrupted {
                return Err(FfsError::Interrupted);
            }
            if let Some(binding) = &state.binding {
                return Ok((binding.clone(), state.generation));
            }
            drop(state);
            self.session.check_alive()?;

            // Errored while waiting: only a first read may keep waiting
            if self.file.is_removed() || self.first_read_done {
                return Err(FfsError::DeviceGone);
            }
            debug!("{}: endpoint cycled before first read, still waiting", self.name());
            self.file.clear_error();
        }
    }

    /// Direction mismatch: halt the endpoint
    fn halt(&self, binding: &Binding, generation: u64) -> Result<usize> {
        if binding.isoc {
            return Err(FfsError::InvalidArgument("isochronous endpoint cannot halt"));
        }
        let _io = self.file.io.acquire(&self.waiter, self.session.tick())?;
        if !self.file.is_current(generation) {
            return Err(FfsError::DeviceGone);
        }
        if let Err(e) = binding.ep.hw.set_halt() {
            warn!("{}: set_halt failed: {}", self.name(), e);
        }
        Err(FfsError::Halted)
    }

    /// Read up to `buf.len()` bytes
    ///
    /// The request queued to hardware is `buf.len()` aligned up by the
    /// controller; receiving more than `buf.len()` fails with `Overflow`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.session.check_alive()?;
        loop {
            let (binding, generation) = self.wait_for_endpoint(true)?;
            if binding.is_in {
                return self.halt(&binding, generation);
            }
            let length = binding.ep.hw.align(buf.len());

            let io = self.file.io.acquire(&self.waiter, self.session.tick())?;
            if !self.file.is_current(generation) {
                return Err(FfsError::DeviceGone);
            }
            let (transfer, id) = read_request(&binding.ep, length)?;

            let completed = match transfer.wait(&self.waiter, self.session.tick()) {
                Some(result) => result,
                None => {
                    if self.file.is_current(generation) {
                        let _ = binding.ep.hw.dequeue(id);
                    }
                    match transfer.try_take() {
                        Some(result @ (_, Ok(_))) => result,
                        _ => return Err(FfsError::Interrupted),
                    }
                }
            };
            binding.ep.clear_inflight(&transfer);
            drop(io);

            let (data, status) = completed;
            let aborted =
                !self.file.is_current(generation) || status == Err(HwError::Shutdown);
            if aborted {
                if !self.first_read_done && !self.file.is_removed() {
                    debug!("{}: read aborted by endpoint disable, retrying", self.name());
                    self.file.clear_error();
                    continue;
                }
                return Err(FfsError::DeviceGone);
            }

            let n = status?;
            if n > buf.len() {
                return Err(FfsError::Overflow {
                    received: n,
                    capacity: buf.len(),
                });
            }
            let n = n.min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            self.first_read_done = true;
            trace!("{}: read {} bytes", self.name(), n);
            return Ok(n);
        }
    }

    /// Write `data` as one transfer
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.session.check_alive()?;
        let (binding, generation) = self.wait_for_endpoint(false)?;
        if !binding.is_in {
            return self.halt(&binding, generation);
        }

        let _io = self.file.io.acquire(&self.waiter, self.session.tick())?;
        if !self.file.is_current(generation) {
            return Err(FfsError::DeviceGone);
        }
        let transfer = Transfer::new();
        let id = binding
            .ep
            .hw
            .queue(HwRequest {
                buf: data.to_vec(),
                length: data.len(),
                zero: false,
                complete: transfer.completion(),
            })
            .map_err(FfsError::Hardware)?;

        let status: HwStatus = match transfer.wait(&self.waiter, self.session.tick()) {
            Some((_, status)) => status,
            None => {
                if self.file.is_current(generation) {
                    let _ = binding.ep.hw.dequeue(id);
                }
                match transfer.try_take() {
                    Some((_, Ok(n))) => Ok(n),
                    _ => return Err(FfsError::Interrupted),
                }
            }
        };
        if !self.file.is_current(generation) {
            return Err(FfsError::DeviceGone);
        }
        let n = status?;
        trace!("{}: wrote {} bytes", self.name(), n);
        Ok(n)
    }

    pub(crate) fn bound(&self) -> Result<Binding> {
        self.session.check_alive()?;
        if self.session.state() != SessionState::Active {
            return Err(FfsError::DeviceGone);
        }
        self.file
            .current()
            .map(|(binding, _)| binding)
            .ok_or(FfsError::DeviceGone)
    }

    /// Bytes waiting in the endpoint FIFO
    pub fn fifo_status(&self) -> Result<usize> {
        Ok(self.bound()?.ep.hw.fifo_status()?)
    }

    pub fn fifo_flush(&self) -> Result<()> {
        self.bound()?.ep.hw.fifo_flush();
        Ok(())
    }

    pub fn clear_halt(&self) -> Result<()> {
        Ok(self.bound()?.ep.hw.clear_halt()?)
    }

    /// Hardware endpoint number behind this file
    pub fn endpoint_revmap(&self) -> Result<u8> {
        Ok(self.bound()?.ep.num & protocol::descriptor::ENDPOINT_NUMBER_MASK)
    }

    /// Descriptor in use at the current link speed
    pub fn endpoint_descriptor(&self) -> Result<EndpointDescriptor> {
        let binding = self.bound()?;
        let speed = {
            let core = lock(&self.session.core);
            core.controller
                .as_ref()
                .map(|c| c.speed())
                .ok_or(FfsError::DeviceGone)?
        };
        binding
            .ep
            .exact_descriptor(speed)
            .cloned()
            .ok_or(FfsError::InvalidArgument("no descriptor for link speed"))
    }
}

impl Drop for EndpointChannel {
    fn drop(&mut self) {
        self.file.release();
        debug!("{}: released {}", self.session.name(), self.file.name());
        self.session.handle_closed();
    }
}

/// Queue a read on `ep`, or adopt the one already in flight
fn read_request(ep: &Arc<LiveEndpoint>, length: usize) -> Result<(Arc<Transfer>, RequestId)> {
    let mut inflight = lock(&ep.inflight);
    if let Some(pending) = inflight.as_ref()
        && !pending.transfer.has_failed()
    {
        trace!("{}: adopting in-flight read", ep.hw.name());
        return Ok((pending.transfer.clone(), pending.id));
    }
    let transfer = Transfer::new();
    let id = ep
        .hw
        .queue(HwRequest {
            buf: vec![0; length],
            length,
            zero: false,
            complete: transfer.completion(),
        })
        .map_err(FfsError::Hardware)?;
    *inflight = Some(InFlight {
        transfer: transfer.clone(),
        id,
    });
    Ok((transfer, id))
}
