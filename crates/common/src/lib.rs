//! Common utilities for ffs-gadget
//!
//! This crate provides the plumbing shared by the gadget engine and its
//! binary: error handling, logging setup, the deferred completion work
//! queue, and upload fixtures for tests.

pub mod error;
pub mod logging;
pub mod test_utils;
pub mod work;

pub use error::{Error, Result};
pub use logging::{setup_logging, try_setup_logging};
pub use work::{Job, WorkPermit, WorkQueue, WorkRunner, create_work_queue};
