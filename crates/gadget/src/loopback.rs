//! Software controller and hosts
//!
//! [`LoopbackController`] plays both ends of the wire: the function sees an
//! ordinary [`Controller`], while the `host_*` methods act as the USB host,
//! issuing control requests and moving data on the claimed endpoints. The
//! CLI simulation and the integration tests run on it.

use crate::error::{FfsError, HwError, Result};
use crate::function::{GadgetFunction, SetupOutcome};
use crate::hw::{ChannelHost, Controller, HwEndpoint, HwRequest, Notifier, RequestId};
use crate::sync::lock;
use protocol::descriptor::ENDPOINT_NUMBER_MASK;
use protocol::{Direction, EndpointDescriptor, SetupPacket, UsbSpeed};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const EP0_MAX_PACKET: u16 = 64;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Link speed reported once connected
    pub speed: UsbSpeed,
    pub max_speed: UsbSpeed,
    pub use_os_strings: bool,
    /// Round OUT reads up to whole packets
    pub align_out: bool,
    /// Endpoint numbers available to autoconfig, counted from 1
    pub endpoints: u8,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            speed: UsbSpeed::High,
            max_speed: UsbSpeed::Super,
            use_os_strings: false,
            align_out: false,
            endpoints: 15,
        }
    }
}

struct Queued {
    id: RequestId,
    request: HwRequest,
}

struct EndpointState {
    enabled: bool,
    halted: bool,
    refuse_enable: bool,
    max_packet: u16,
    queue: VecDeque<Queued>,
    next_id: RequestId,
}

/// Software endpoint
pub struct LoopbackEndpoint {
    name: String,
    address: u8,
    align_out: bool,
    state: Mutex<EndpointState>,
    cond: Condvar,
}

impl std::fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("name", &self.name)
            .field("address", &format_args!("0x{:02x}", self.address))
            .finish_non_exhaustive()
    }
}

impl LoopbackEndpoint {
    fn new(name: String, address: u8, max_packet: u16, enabled: bool, align_out: bool) -> Self {
        Self {
            name,
            address,
            align_out,
            state: Mutex::new(EndpointState {
                enabled,
                halted: false,
                refuse_enable: false,
                max_packet,
                queue: VecDeque::new(),
                next_id: 1,
            }),
            cond: Condvar::new(),
        }
    }

    fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn is_halted(&self) -> bool {
        lock(&self.state).halted
    }

    /// Requests queued by the function
    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Make the next enable fail as if the controller ran out of FIFO space
    pub fn fail_next_enable(&self) {
        lock(&self.state).refuse_enable = true;
    }

    /// Wait for the oldest queued request
    ///
    /// A halted endpoint answers with `Stalled` and drops the halt.
    fn take(&self, timeout: Duration) -> std::result::Result<Queued, HwError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.halted {
                state.halted = false;
                return Err(HwError::Stalled);
            }
            if let Some(queued) = state.queue.pop_front() {
                return Ok(queued);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HwError::Timeout);
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    /// Host receives from a device IN request
    fn host_receive(&self, max: usize, timeout: Duration) -> std::result::Result<Vec<u8>, HwError> {
        let Queued { id, request } = self.take(timeout)?;
        let n = request.length.min(request.buf.len()).min(max);
        let data = request.buf[..n].to_vec();
        trace!("{}: host received {} bytes from request {}", self.name, n, id);
        (request.complete)(request.buf, Ok(n));
        Ok(data)
    }

    /// Host sends into a device OUT request
    fn host_send(&self, data: &[u8], timeout: Duration) -> std::result::Result<usize, HwError> {
        let Queued { id, request } = self.take(timeout)?;
        let mut buf = request.buf;
        buf.resize(request.length, 0);
        let n = data.len().min(request.length);
        buf[..n].copy_from_slice(&data[..n]);
        trace!("{}: host sent {} bytes into request {}", self.name, n, id);
        (request.complete)(buf, Ok(n));
        Ok(n)
    }
}

impl HwEndpoint for LoopbackEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn max_packet(&self) -> u16 {
        lock(&self.state).max_packet
    }

    fn align(&self, len: usize) -> usize {
        let max_packet = usize::from(self.max_packet());
        if self.align_out && self.direction() == Direction::Out && max_packet > 0 {
            len.div_ceil(max_packet) * max_packet
        } else {
            len
        }
    }

    fn enable(&self, desc: &EndpointDescriptor) -> std::result::Result<(), HwError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.refuse_enable) {
            warn!("{}: enable refused", self.name);
            return Err(HwError::NoResources);
        }
        state.enabled = true;
        state.halted = false;
        state.max_packet = desc.max_packet();
        debug!("{}: enabled, max packet {}", self.name, state.max_packet);
        Ok(())
    }

    fn disable(&self) {
        let drained: Vec<Queued> = {
            let mut state = lock(&self.state);
            state.enabled = false;
            state.queue.drain(..).collect()
        };
        debug!("{}: disabled, {} requests shut down", self.name, drained.len());
        for Queued { request, .. } in drained {
            (request.complete)(request.buf, Err(HwError::Shutdown));
        }
        self.cond.notify_all();
    }

    fn queue(&self, request: HwRequest) -> std::result::Result<RequestId, HwError> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Err(HwError::NotEnabled);
        }
        let id = state.next_id;
        state.next_id += 1;
        trace!("{}: queued request {} ({} bytes)", self.name, id, request.length);
        state.queue.push_back(Queued { id, request });
        drop(state);
        self.cond.notify_all();
        Ok(id)
    }

    fn dequeue(&self, id: RequestId) -> std::result::Result<(), HwError> {
        let queued = {
            let mut state = lock(&self.state);
            let position = state
                .queue
                .iter()
                .position(|q| q.id == id)
                .ok_or(HwError::NotQueued)?;
            state.queue.remove(position)
        };
        if let Some(Queued { request, .. }) = queued {
            trace!("{}: dequeued request {}", self.name, id);
            (request.complete)(request.buf, Err(HwError::Cancelled));
        }
        Ok(())
    }

    fn set_halt(&self) -> std::result::Result<(), HwError> {
        lock(&self.state).halted = true;
        self.cond.notify_all();
        Ok(())
    }

    fn clear_halt(&self) -> std::result::Result<(), HwError> {
        lock(&self.state).halted = false;
        Ok(())
    }

    fn fifo_status(&self) -> std::result::Result<usize, HwError> {
        if lock(&self.state).enabled {
            Ok(0)
        } else {
            Err(HwError::NotEnabled)
        }
    }

    fn fifo_flush(&self) {}
}

struct Allocation {
    next_interface: u16,
    next_string: u16,
    reserved: HashSet<u8>,
    /// Claimed endpoints by number; a dropped endpoint frees its number
    claimed: [Option<Weak<LoopbackEndpoint>>; 16],
}

/// Controller simulated in software
pub struct LoopbackController {
    options: LoopbackOptions,
    speed: Mutex<UsbSpeed>,
    ep0: Arc<LoopbackEndpoint>,
    alloc: Mutex<Allocation>,
}

impl std::fmt::Debug for LoopbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackController")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LoopbackController {
    pub fn new(options: LoopbackOptions) -> Self {
        let speed = options.speed.min(options.max_speed);
        Self {
            speed: Mutex::new(speed),
            ep0: Arc::new(LoopbackEndpoint::new(
                "ep0".to_string(),
                0,
                EP0_MAX_PACKET,
                true,
                false,
            )),
            alloc: Mutex::new(Allocation {
                next_interface: 0,
                next_string: 1,
                reserved: HashSet::new(),
                claimed: Default::default(),
            }),
            options,
        }
    }

    /// Renegotiate the link speed, capped at `max_speed`
    pub fn set_speed(&self, speed: UsbSpeed) {
        *lock(&self.speed) = speed.min(self.options.max_speed);
    }

    /// Hand the next `count` interface ids to other functions
    pub fn reserve_interfaces(&self, count: u8) {
        lock(&self.alloc).next_interface += u16::from(count);
    }

    /// Keep endpoint numbers away from autoconfig
    pub fn reserve_endpoints(&self, numbers: &[u8]) {
        lock(&self.alloc)
            .reserved
            .extend(numbers.iter().map(|n| n & ENDPOINT_NUMBER_MASK));
    }

    /// Live endpoint claimed at `address`
    pub fn endpoint(&self, address: u8) -> Option<Arc<LoopbackEndpoint>> {
        let alloc = lock(&self.alloc);
        alloc.claimed[usize::from(address & ENDPOINT_NUMBER_MASK)]
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|ep| ep.address == address)
    }

    fn endpoint_or_gone(&self, address: u8) -> std::result::Result<Arc<LoopbackEndpoint>, HwError> {
        self.endpoint(address).ok_or(HwError::NotEnabled)
    }

    /// Host sends a control request to `function`
    pub fn host_setup(&self, function: &GadgetFunction, packet: SetupPacket) -> Result<SetupOutcome> {
        self.ep0.clear_halt().map_err(FfsError::Hardware)?;
        function.setup(&packet)
    }

    /// Host reads the IN data stage (or zero-length status) of ep0
    pub fn host_control_in(&self, max: usize, timeout: Duration) -> std::result::Result<Vec<u8>, HwError> {
        self.ep0.host_receive(max, timeout)
    }

    /// Host sends the OUT data stage (or zero-length status) of ep0
    pub fn host_control_out(&self, data: &[u8], timeout: Duration) -> std::result::Result<usize, HwError> {
        self.ep0.host_send(data, timeout)
    }

    pub fn ep0_stalled(&self) -> bool {
        self.ep0.is_halted()
    }

    /// Host reads from device IN endpoint `address`
    pub fn host_read(
        &self,
        address: u8,
        max: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, HwError> {
        self.endpoint_or_gone(address)?.host_receive(max, timeout)
    }

    /// Host writes to device OUT endpoint `address`
    pub fn host_write(
        &self,
        address: u8,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, HwError> {
        self.endpoint_or_gone(address)?.host_send(data, timeout)
    }

    /// Requests queued on endpoint `address`, 0 if unclaimed
    pub fn pending(&self, address: u8) -> usize {
        self.endpoint(address).map_or(0, |ep| ep.pending())
    }
}

impl Controller for LoopbackController {
    fn speed(&self) -> UsbSpeed {
        *lock(&self.speed)
    }

    fn max_speed(&self) -> UsbSpeed {
        self.options.max_speed
    }

    fn ep0(&self) -> Arc<dyn HwEndpoint> {
        self.ep0.clone()
    }

    fn autoconfig(&self, desc: &mut EndpointDescriptor) -> Option<Arc<dyn HwEndpoint>> {
        let mut alloc = lock(&self.alloc);
        let limit = self.options.endpoints.min(ENDPOINT_NUMBER_MASK);
        let free = |alloc: &Allocation, n: u8| {
            !alloc.reserved.contains(&n)
                && alloc.claimed[usize::from(n)]
                    .as_ref()
                    .is_none_or(|weak| weak.strong_count() == 0)
        };

        let wanted = desc.address & ENDPOINT_NUMBER_MASK;
        let number = if (1..=limit).contains(&wanted) && free(&alloc, wanted) {
            wanted
        } else {
            (1..=limit).find(|&n| free(&alloc, n))?
        };

        let address = (desc.address & 0x80) | number;
        if desc.max_packet_size == 0 {
            desc.max_packet_size = 64;
        }
        let direction = if address & 0x80 != 0 { "in" } else { "out" };
        let ep = Arc::new(LoopbackEndpoint::new(
            format!("ep{}{}", number, direction),
            address,
            desc.max_packet(),
            false,
            self.options.align_out,
        ));
        alloc.claimed[usize::from(number)] = Some(Arc::downgrade(&ep));
        desc.address = address;
        debug!("autoconfig: 0x{:02x} -> {}", wanted, ep.name);
        Some(ep)
    }

    fn interface_id(&self) -> std::result::Result<u8, HwError> {
        let mut alloc = lock(&self.alloc);
        let id = u8::try_from(alloc.next_interface).map_err(|_| HwError::NoResources)?;
        alloc.next_interface += 1;
        Ok(id)
    }

    fn string_ids(&self, count: usize) -> std::result::Result<u8, HwError> {
        let mut alloc = lock(&self.alloc);
        let first = alloc.next_string;
        let next = usize::from(first) + count;
        if next > 256 {
            return Err(HwError::NoResources);
        }
        alloc.next_string = next as u16;
        u8::try_from(first).map_err(|_| HwError::NoResources)
    }

    fn use_os_strings(&self) -> bool {
        self.options.use_os_strings
    }
}

/// Notification handle that counts its signals
#[derive(Debug, Default)]
pub struct CountingNotifier {
    signals: AtomicUsize,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }
}

impl Notifier for CountingNotifier {
    fn signal(&self) {
        self.signals.fetch_add(1, Ordering::AcqRel);
    }
}

/// Channel host that keeps endpoint files in memory
#[derive(Debug, Default)]
pub struct MemoryHost {
    files: Mutex<BTreeSet<(String, String)>>,
    notifiers: Mutex<HashMap<u32, Arc<CountingNotifier>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint files published for `session`
    pub fn files(&self, session: &str) -> Vec<String> {
        lock(&self.files)
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Make a handle resolvable by descriptor uploads
    pub fn register_notifier(&self, handle: u32) -> Arc<CountingNotifier> {
        lock(&self.notifiers).entry(handle).or_default().clone()
    }

    /// Make creating endpoint file `name` fail
    pub fn fail_file(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }
}

impl ChannelHost for MemoryHost {
    fn create_endpoint_file(&self, session: &str, name: &str) -> Result<()> {
        if lock(&self.failing).contains(name) {
            return Err(FfsError::OutOfResources);
        }
        lock(&self.files).insert((session.to_string(), name.to_string()));
        Ok(())
    }

    fn remove_endpoint_file(&self, session: &str, name: &str) {
        lock(&self.files).remove(&(session.to_string(), name.to_string()));
    }

    fn resolve_notifier(&self, handle: u32) -> Result<Arc<dyn Notifier>> {
        lock(&self.notifiers)
            .get(&handle)
            .cloned()
            .map(|n| n as Arc<dyn Notifier>)
            .ok_or(FfsError::InvalidArgument("unknown notification handle"))
    }
}
