//! Asynchronous endpoint I/O
//!
//! A submission queues the hardware request immediately and returns. The
//! hardware completion only hands the finished request to the session's
//! work queue; copy-out, result delivery and the notifier signal run on the
//! work thread. The completion channel is a `tokio::sync::oneshot`, so the
//! result can be awaited or received blocking.

use crate::epfile::{Binding, EndpointChannel};
use crate::error::{FfsError, HwError, Result};
use crate::hw::{HwRequest, HwStatus, RequestId};
use common::WorkPermit;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Identifies a submitted request for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioTicket {
    slot: usize,
    generation: u64,
    id: RequestId,
}

/// Finished asynchronous transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AioOutcome {
    Read(Vec<u8>),
    Written(usize),
}

/// Submitted request and the receiver of its single completion
#[derive(Debug)]
pub struct AioRequest {
    pub ticket: AioTicket,
    pub completion: oneshot::Receiver<Result<AioOutcome>>,
}

impl EndpointChannel {
    /// Queue a read of up to `len` bytes
    pub fn submit_read(&self, len: usize) -> Result<AioRequest> {
        self.session.check_alive()?;
        let (binding, generation) = self.wait_for_endpoint(true)?;
        if binding.is_in {
            return Err(self.async_halt(&binding));
        }
        let length = binding.ep.hw.align(len);
        self.submit(binding, generation, vec![0; length], length, Some(len))
    }

    /// Queue a write of `data`
    pub fn submit_write(&self, data: Vec<u8>) -> Result<AioRequest> {
        self.session.check_alive()?;
        let (binding, generation) = self.wait_for_endpoint(false)?;
        if !binding.is_in {
            return Err(self.async_halt(&binding));
        }
        let length = data.len();
        self.submit(binding, generation, data, length, None)
    }

    /// Dequeue a submitted request
    ///
    /// Fails with `InvalidArgument` once the endpoint the request was
    /// queued on has been disabled or rebound.
    pub fn cancel(&self, ticket: &AioTicket) -> Result<()> {
        if ticket.slot != self.file.slot() {
            return Err(FfsError::InvalidArgument("ticket belongs to another endpoint"));
        }
        let Some((binding, generation)) = self.file.current() else {
            return Err(FfsError::InvalidArgument("endpoint no longer bound"));
        };
        if generation != ticket.generation {
            return Err(FfsError::InvalidArgument("endpoint rebound since submission"));
        }
        binding.ep.hw.dequeue(ticket.id).map_err(|e| match e {
            HwError::NotQueued => FfsError::InvalidArgument("request already completed"),
            other => FfsError::Hardware(other),
        })
    }

    fn async_halt(&self, binding: &Binding) -> FfsError {
        if binding.isoc {
            return FfsError::InvalidArgument("isochronous endpoint cannot halt");
        }
        if let Err(e) = binding.ep.hw.set_halt() {
            warn!("{}: set_halt failed: {}", self.name(), e);
        }
        FfsError::Halted
    }

    /// `read_len` is the caller's read size, `None` for writes
    fn submit(
        &self,
        binding: Binding,
        generation: u64,
        buf: Vec<u8>,
        length: usize,
        read_len: Option<usize>,
    ) -> Result<AioRequest> {
        let permit = self
            .session
            .env
            .work
            .reserve()
            .map_err(|_| FfsError::OutOfResources)?;
        let (tx, rx) = oneshot::channel();
        let session = self.session.clone();
        let name = self.name().to_string();

        let complete = Box::new(move |buf: Vec<u8>, status: HwStatus| {
            deliver(permit, session, name, buf, status, read_len, tx);
        });
        let id = binding
            .ep
            .hw
            .queue(HwRequest {
                buf,
                length,
                zero: false,
                complete,
            })
            .map_err(FfsError::Hardware)?;
        debug!("{}: submitted request {} ({} bytes)", self.name(), id, length);

        Ok(AioRequest {
            ticket: AioTicket {
                slot: self.file.slot(),
                generation,
                id,
            },
            completion: rx,
        })
    }
}

/// Hardware completion: hand the result to the work thread
fn deliver(
    permit: WorkPermit,
    session: Arc<crate::session::Session>,
    name: String,
    mut buf: Vec<u8>,
    status: HwStatus,
    read_len: Option<usize>,
    tx: oneshot::Sender<Result<AioOutcome>>,
) {
    let job = Box::new(move || {
        let outcome = match (status, read_len) {
            (Ok(n), Some(capacity)) if n > capacity => Err(FfsError::Overflow {
                received: n,
                capacity,
            }),
            (Ok(n), Some(_)) => {
                buf.truncate(n);
                Ok(AioOutcome::Read(buf))
            }
            (Ok(n), None) => Ok(AioOutcome::Written(n)),
            (Err(e), _) => Err(FfsError::from(e)),
        };
        debug!("{}: async completion {:?}", name, outcome.as_ref().map(|_| ()));
        if tx.send(outcome).is_err() {
            debug!("{}: completion receiver dropped", name);
        }
        session.signal_notifier();
    });
    permit.submit_or_run(job);
}
