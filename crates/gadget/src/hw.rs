//! Collaborator traits: the controller below the engine and the hosts above it
//!
//! The engine never owns hardware. A [`Controller`] hands out endpoints at
//! bind time, a [`ChannelHost`] publishes endpoint files, and a [`Binder`]
//! is told when the function becomes usable.

use crate::error::{FfsError, HwError, Result};
use crate::session::Session;
use protocol::{EndpointDescriptor, UsbSpeed};
use std::sync::Arc;

/// Bytes transferred, or the reason the request failed
pub type HwStatus = std::result::Result<usize, HwError>;

/// Request completion callback
///
/// Receives the request buffer back with the status. Runs in the hardware
/// completion context and must not block.
pub type Completion = Box<dyn FnOnce(Vec<u8>, HwStatus) + Send + 'static>;

/// Handle of a queued request, unique per endpoint
pub type RequestId = u64;

/// One hardware transfer request
pub struct HwRequest {
    /// Outgoing data, or the receive buffer sized to `length`
    pub buf: Vec<u8>,
    pub length: usize,
    /// Terminate a short IN transfer with a zero-length packet
    pub zero: bool,
    pub complete: Completion,
}

impl std::fmt::Debug for HwRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwRequest")
            .field("length", &self.length)
            .field("zero", &self.zero)
            .finish_non_exhaustive()
    }
}

/// One hardware endpoint
pub trait HwEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Current bEndpointAddress
    fn address(&self) -> u8;

    fn max_packet(&self) -> u16;

    /// Receive length the controller needs for a read of `len` bytes
    fn align(&self, len: usize) -> usize {
        len
    }

    fn enable(&self, desc: &EndpointDescriptor) -> std::result::Result<(), HwError>;

    /// Disable and complete every outstanding request with [`HwError::Shutdown`]
    fn disable(&self);

    fn queue(&self, request: HwRequest) -> std::result::Result<RequestId, HwError>;

    /// Dequeue `id`, completing it with [`HwError::Cancelled`]
    fn dequeue(&self, id: RequestId) -> std::result::Result<(), HwError>;

    fn set_halt(&self) -> std::result::Result<(), HwError>;

    fn clear_halt(&self) -> std::result::Result<(), HwError>;

    /// Bytes held in the endpoint FIFO
    fn fifo_status(&self) -> std::result::Result<usize, HwError>;

    fn fifo_flush(&self);
}

/// The device controller the function is configured on
pub trait Controller: Send + Sync {
    /// Negotiated link speed
    fn speed(&self) -> UsbSpeed;

    fn max_speed(&self) -> UsbSpeed;

    fn ep0(&self) -> Arc<dyn HwEndpoint>;

    /// Claim a hardware endpoint matching `desc`
    ///
    /// Rewrites `desc.address` to the claimed endpoint's address.
    fn autoconfig(&self, desc: &mut EndpointDescriptor) -> Option<Arc<dyn HwEndpoint>>;

    /// Allocate a configuration-wide interface number
    fn interface_id(&self) -> std::result::Result<u8, HwError>;

    /// Allocate `count` consecutive string ids, returning the first
    fn string_ids(&self, count: usize) -> std::result::Result<u8, HwError>;

    /// Whether the host side requested Microsoft OS descriptors
    fn use_os_strings(&self) -> bool {
        false
    }

    /// Controller-specific control operation
    fn ioctl(&self, _code: u32, _value: u64) -> Result<u64> {
        Err(FfsError::NotSupported)
    }
}

/// Asynchronous event signal handed over by the descriptor upload
pub trait Notifier: Send + Sync {
    fn signal(&self);
}

/// Publishes endpoint files for a session
pub trait ChannelHost: Send + Sync {
    fn create_endpoint_file(&self, session: &str, name: &str) -> Result<()>;

    fn remove_endpoint_file(&self, session: &str, name: &str);

    /// Resolve the notification handle of a descriptor upload
    fn resolve_notifier(&self, handle: u32) -> Result<Arc<dyn Notifier>>;
}

/// Receives readiness changes of a session
pub trait Binder: Send + Sync {
    /// Strings accepted and endpoint files created
    fn ready(&self, session: &Arc<Session>) -> Result<()>;

    /// Session is being reset after `ready`
    fn closed(&self, session: &Arc<Session>);
}
