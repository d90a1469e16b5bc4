//! Shared rig for the engine integration tests
//!
//! A registry on an in-memory host, a loopback controller and a running
//! completion worker.

#![allow(dead_code)]

use common::test_utils::{DEFAULT_TEST_TIMEOUT, FunctionFixture};
use common::{WorkQueue, create_work_queue};
use gadget::{
    Binder, ControlChannel, GadgetFunction, InstanceOptions, LoopbackController, LoopbackOptions,
    MemoryHost, Registry, Session, Waiter,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const TICK: Duration = Duration::from_millis(2);

pub struct Rig {
    pub registry: Registry,
    pub host: Arc<MemoryHost>,
    pub controller: Arc<LoopbackController>,
    work: WorkQueue,
    worker: Option<JoinHandle<()>>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        let _ = common::try_setup_logging("debug");
        let (work, runner) = create_work_queue(16);
        let worker = runner.spawn("test-work").unwrap();
        let host = Arc::new(MemoryHost::new());
        Self {
            registry: Registry::new(host.clone(), work.clone(), TICK),
            host,
            controller: Arc::new(LoopbackController::new(options)),
            work,
            worker: Some(worker),
        }
    }

    /// Stop the completion worker, as on shutdown
    pub fn close_work_queue(&self) {
        self.work.close();
    }

    pub fn instance(&self, name: &str, options: InstanceOptions) {
        self.registry.create_instance(name, options).unwrap();
    }

    pub fn open(&self, name: &str) -> ControlChannel {
        self.registry.open_control(name, waiter()).unwrap()
    }

    /// Create `name` and upload `fixture`, leaving the session active
    pub fn active(&self, name: &str, fixture: &FunctionFixture) -> (ControlChannel, Arc<Session>) {
        self.active_with(name, fixture, InstanceOptions::default())
    }

    pub fn active_with(
        &self,
        name: &str,
        fixture: &FunctionFixture,
        options: InstanceOptions,
    ) -> (ControlChannel, Arc<Session>) {
        self.instance(name, options);
        let mut control = self.open(name);
        control.write(&fixture.descriptors()).unwrap();
        control.write(&fixture.strings()).unwrap();
        let session = control.session().clone();
        (control, session)
    }

    /// Bind a function on `session` and enable its endpoints
    pub fn enabled(&self, session: &Arc<Session>) -> GadgetFunction {
        let function = self.bound(session);
        let interface = function.interface_number(0).unwrap();
        function.set_alt(u16::from(interface), Some(0)).unwrap();
        function
    }

    pub fn bound(&self, session: &Arc<Session>) -> GadgetFunction {
        let function = GadgetFunction::new(session.clone());
        function.bind(self.controller.clone()).unwrap();
        function
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.work.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Blocking waiter that gives up after the test timeout
pub fn waiter() -> Waiter {
    Waiter::blocking().with_timeout(DEFAULT_TEST_TIMEOUT)
}

/// Poll `cond` until it holds or the test timeout passes
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEFAULT_TEST_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Binder that counts its callbacks and can refuse readiness
#[derive(Default)]
pub struct RecordingBinder {
    pub ready: AtomicUsize,
    pub closed: AtomicUsize,
    pub refuse: AtomicBool,
}

impl RecordingBinder {
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Binder for RecordingBinder {
    fn ready(&self, _session: &Arc<Session>) -> gadget::Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(gadget::FfsError::OutOfResources);
        }
        self.ready.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn closed(&self, _session: &Arc<Session>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
