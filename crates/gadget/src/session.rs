//! Session lifecycle
//!
//! A [`Session`] is one named function instance: its uploaded descriptor
//! and string tables, its event queue, its endpoint files and the bind
//! state of the function built from it. Channels and function hooks hold an
//! `Arc<Session>`; the session lives while any of them does.
//!
//! Lock order is `op` (held across whole control operations), then `core`,
//! then `events`. Endpoint file state locks are never held while `core` is
//! being acquired.

use crate::bind::BoundFunction;
use crate::epfile::{EndpointChannel, EpFile};
use crate::error::{FfsError, Result};
use crate::events::{EventQueue, SetupState};
use crate::hw::{Binder, ChannelHost, Controller, Notifier};
use crate::registry::RegistryShared;
use crate::sync::{DEFAULT_WAIT_TICK, OpLock, Waiter, lock};
use common::WorkQueue;
use protocol::{DescriptorTable, EventType, SetupPacket, StringTable};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Waiting for the descriptor upload
    CollectingDescriptors,
    /// Waiting for the string upload
    CollectingStrings,
    Active,
    /// All handles closed with `no_disconnect`; the function stays bound
    Deactivated,
    /// Tearing down, reopening is refused
    Closing,
}

/// Per-instance options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Keep the function attached when the last handle closes
    pub no_disconnect: bool,
    /// Recheck interval of interruptible waits
    pub wait_tick: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            no_disconnect: false,
            wait_tick: DEFAULT_WAIT_TICK,
        }
    }
}

/// What a session needs from the outside
#[derive(Clone)]
pub(crate) struct SessionEnv {
    pub(crate) host: Arc<dyn ChannelHost>,
    pub(crate) binder: Option<Arc<dyn Binder>>,
    pub(crate) work: WorkQueue,
    pub(crate) registry: Weak<RegistryShared>,
}

pub(crate) struct Core {
    pub(crate) state: SessionState,
    pub(crate) table: Option<Arc<DescriptorTable>>,
    pub(crate) strings: Vec<StringTable>,
    /// Open control and endpoint handles
    pub(crate) opened: usize,
    pub(crate) epfiles: Vec<Arc<EpFile>>,
    /// Set while at least one function is bound
    pub(crate) controller: Option<Arc<dyn Controller>>,
    pub(crate) bind_refs: usize,
    /// Function whose endpoints are enabled
    pub(crate) active: Option<Arc<BoundFunction>>,
    /// `Binder::ready` succeeded, so `closed` is owed
    pub(crate) ready_called: bool,
    /// Reset waits for the last unbind
    pub(crate) reset_pending: bool,
}

impl Core {
    fn new() -> Self {
        Self {
            state: SessionState::CollectingDescriptors,
            table: None,
            strings: Vec::new(),
            opened: 0,
            epfiles: Vec::new(),
            controller: None,
            bind_refs: 0,
            active: None,
            ready_called: false,
            reset_pending: false,
        }
    }
}

pub struct Session {
    name: String,
    options: SessionOptions,
    pub(crate) env: SessionEnv,
    /// Cleared when the instance is removed
    alive: AtomicBool,
    pub(crate) op: OpLock,
    pub(crate) core: Mutex<Core>,
    pub(crate) events: Mutex<EventQueue>,
    pub(crate) events_cond: Condvar,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(name: &str, options: SessionOptions, env: SessionEnv) -> Arc<Self> {
        debug!("Creating session {}", name);
        Arc::new(Self {
            name: name.to_string(),
            options,
            env,
            alive: AtomicBool::new(true),
            op: OpLock::default(),
            core: Mutex::new(Core::new()),
            events: Mutex::new(EventQueue::new()),
            events_cond: Condvar::new(),
            notifier: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        lock(&self.core).state
    }

    pub fn setup_state(&self) -> SetupState {
        lock(&self.events).setup_state()
    }

    /// Event types queued and not yet read
    pub fn queued_events(&self) -> Vec<EventType> {
        lock(&self.events).kinds().to_vec()
    }

    /// Names of the published endpoint files
    pub fn endpoint_files(&self) -> Vec<String> {
        lock(&self.core)
            .epfiles
            .iter()
            .map(|file| file.name().to_string())
            .collect()
    }

    pub fn descriptor_table(&self) -> Option<Arc<DescriptorTable>> {
        lock(&self.core).table.clone()
    }

    /// String tables, with ids once a function is bound
    pub fn strings(&self) -> Vec<StringTable> {
        lock(&self.core).strings.clone()
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.core).controller.is_some()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.core).opened
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn no_disconnect(&self) -> bool {
        self.options.no_disconnect
    }

    pub(crate) fn tick(&self) -> Duration {
        self.options.wait_tick
    }

    /// Fail every later operation and wake blocked readers
    pub(crate) fn mark_removed(&self) {
        self.alive.store(false, Ordering::Release);
        {
            let _events = lock(&self.events);
            self.events_cond.notify_all();
        }
        let files = lock(&self.core).epfiles.clone();
        for file in files {
            file.wake();
        }
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(FfsError::DeviceGone)
        }
    }

    /// Open the endpoint file `name`
    pub fn open_endpoint(self: &Arc<Self>, name: &str, waiter: Waiter) -> Result<EndpointChannel> {
        self.check_alive()?;
        let mut core = lock(&self.core);
        if core.state != SessionState::Active {
            return Err(FfsError::DeviceGone);
        }
        let file = core
            .epfiles
            .iter()
            .find(|file| file.name() == name)
            .cloned()
            .ok_or(FfsError::InvalidArgument("no such endpoint file"))?;
        file.open()?;
        core.opened += 1;
        debug!("{}: opened {}", self.name, name);
        Ok(EndpointChannel::new(self.clone(), file, waiter))
    }

    pub(crate) fn set_notifier(&self, notifier: Option<Arc<dyn Notifier>>) {
        *lock(&self.notifier) = notifier;
    }

    pub(crate) fn signal_notifier(&self) {
        let notifier = lock(&self.notifier).clone();
        if let Some(notifier) = notifier {
            notifier.signal();
        }
    }

    /// Queue a control event and wake readers
    pub(crate) fn push_event(&self, kind: EventType) {
        lock(&self.events).push(kind);
        self.events_cond.notify_all();
        self.signal_notifier();
    }

    pub(crate) fn push_setup(&self, packet: SetupPacket) {
        lock(&self.events).push_setup(packet);
        self.events_cond.notify_all();
        self.signal_notifier();
    }

    /// Stall ep0 and drop the outstanding request
    pub(crate) fn stall(&self, core: &Core, events: &mut EventQueue) -> FfsError {
        if let Some(controller) = &core.controller
            && let Err(e) = controller.ep0().set_halt()
        {
            warn!("{}: ep0 stall failed: {}", self.name, e);
        }
        events.finish_setup();
        debug!("{}: control request stalled", self.name);
        FfsError::Stalled
    }

    /// Publish one endpoint file per declared slot
    ///
    /// On failure the files created so far are removed again.
    pub(crate) fn create_epfiles(&self, core: &mut Core) -> Result<()> {
        let Some(table) = core.table.clone() else {
            return Err(FfsError::InvalidState(core.state));
        };
        let mut files: Vec<Arc<EpFile>> = Vec::with_capacity(table.eps_count);
        for slot in 1..=table.eps_count {
            let address = table.eps_addrmap.address(slot).unwrap_or(0);
            let name = if table.virtual_addressing() {
                format!("ep{:02x}", address)
            } else {
                format!("ep{}", slot)
            };
            if let Err(e) = self.env.host.create_endpoint_file(&self.name, &name) {
                warn!("{}: creating {} failed: {}", self.name, name, e);
                for file in &files {
                    self.env.host.remove_endpoint_file(&self.name, file.name());
                }
                return Err(e);
            }
            files.push(Arc::new(EpFile::new(name, slot)));
        }
        core.epfiles = files;
        Ok(())
    }

    fn destroy_epfiles(&self, core: &mut Core) {
        for file in core.epfiles.drain(..) {
            file.remove();
            self.env.host.remove_endpoint_file(&self.name, file.name());
        }
    }

    /// A handle was closed
    pub(crate) fn handle_closed(self: &Arc<Self>) {
        let mut core = lock(&self.core);
        core.opened = core.opened.saturating_sub(1);
        if core.opened > 0 {
            return;
        }

        if self.options.no_disconnect {
            core.state = SessionState::Deactivated;
            self.destroy_epfiles(&mut core);
            let mut events = lock(&self.events);
            if matches!(events.setup_state(), SetupState::Pending { .. }) {
                self.stall(&core, &mut events);
            }
            drop(events);
            drop(core);
            info!("{}: deactivated, function stays attached", self.name);
        } else {
            core.state = SessionState::Closing;
            drop(core);
            self.reset();
        }

        if !self.is_alive()
            && let Some(registry) = self.env.registry.upgrade()
        {
            registry.reap(self);
        }
    }

    /// Return to `CollectingDescriptors`
    ///
    /// Called in `Closing`. While a function is still bound the reset is
    /// completed by the last unbind.
    pub(crate) fn reset(self: &Arc<Self>) {
        let call_closed = std::mem::take(&mut lock(&self.core).ready_called);
        if call_closed && let Some(binder) = &self.env.binder {
            binder.closed(self);
        }

        let mut core = lock(&self.core);
        if core.controller.is_some() {
            debug!("{}: reset deferred until unbind", self.name);
            core.reset_pending = true;
            return;
        }
        self.finish_reset(&mut core);
    }

    fn finish_reset(&self, core: &mut Core) {
        self.destroy_epfiles(core);
        core.table = None;
        core.strings.clear();
        core.active = None;
        core.reset_pending = false;
        core.state = SessionState::CollectingDescriptors;
        self.set_notifier(None);
        lock(&self.events).clear();
        self.events_cond.notify_all();
        info!("{}: reset, waiting for descriptors", self.name);
    }

    /// Session-level half of a function bind, reference counted
    ///
    /// The first reference assigns string ids.
    pub(crate) fn bind_controller(&self, controller: &Arc<dyn Controller>) -> Result<()> {
        let mut core = lock(&self.core);
        if core.state != SessionState::Active {
            return Err(FfsError::InvalidState(core.state));
        }
        if core.bind_refs == 0 {
            let count = core.table.as_ref().map_or(0, |t| t.strings_count);
            if count > 0 {
                let first = controller.string_ids(count)?;
                for table in &mut core.strings {
                    for (n, string) in table.strings.iter_mut().take(count).enumerate() {
                        string.id = u8::try_from(usize::from(first) + n)
                            .map_err(|_| FfsError::OutOfResources)?;
                    }
                }
                debug!("{}: {} string ids from {}", self.name, count, first);
            }
            core.controller = Some(controller.clone());
        }
        core.bind_refs += 1;
        Ok(())
    }

    /// Drop one session-level bind reference
    pub(crate) fn unbind_controller(&self) {
        let mut core = lock(&self.core);
        core.bind_refs = core.bind_refs.saturating_sub(1);
        if core.bind_refs > 0 {
            return;
        }
        core.controller = None;
        if core.reset_pending {
            self.finish_reset(&mut core);
        }
    }
}
