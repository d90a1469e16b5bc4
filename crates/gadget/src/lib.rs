//! FunctionFS-style USB function engine
//!
//! A userspace function driver configures a USB function by writing a
//! descriptor upload and a string upload to a session's control channel,
//! then serves control requests over that channel and moves data over one
//! endpoint channel per declared endpoint.
//!
//! The crate is organized bottom-up:
//! - [`events`]: the bounded control event queue and setup sub-state
//! - [`session`]: session lifecycle and shared state
//! - [`control`]: the control channel
//! - [`bind`]: bind-time rewrite of the descriptor template
//! - [`epfile`] and [`aio`]: synchronous and asynchronous endpoint I/O
//! - [`function`]: the bind/unbind/set_alt/setup hooks
//! - [`registry`]: named instances
//! - [`hw`]: collaborator traits, implemented in software by [`loopback`]

pub mod aio;
pub mod bind;
pub mod config;
pub mod control;
pub mod demo;
pub mod epfile;
pub mod error;
pub mod events;
pub mod function;
pub mod hw;
pub mod loopback;
pub mod registry;
pub mod session;
pub mod sync;

pub use aio::{AioOutcome, AioRequest, AioTicket};
pub use bind::{BoundExtProp, OsDescTable, OsDescriptors};
pub use config::GadgetConfig;
pub use control::{ControlChannel, Readiness};
pub use epfile::EndpointChannel;
pub use error::{FfsError, HwError, Result};
pub use events::{EVENT_QUEUE_CAPACITY, SetupState};
pub use function::{GadgetFunction, SetupOutcome};
pub use hw::{Binder, ChannelHost, Completion, Controller, HwEndpoint, HwRequest, HwStatus, Notifier};
pub use loopback::{CountingNotifier, LoopbackController, LoopbackOptions, MemoryHost};
pub use registry::{InstanceOptions, MAX_INSTANCE_NAME_LEN, Registry};
pub use session::{Session, SessionOptions, SessionState};
pub use sync::{DEFAULT_WAIT_TICK, Interrupt, Waiter};
