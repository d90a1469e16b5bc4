//! Blocking primitives shared by the control and endpoint channels
//!
//! Every blocking wait in the engine is a tick-bounded `Condvar` loop. Each
//! tick rechecks the waited-for condition, the caller's [`Interrupt`] token
//! and the caller's deadline, so no wait can outlive an interruption by more
//! than one tick.

use crate::error::{FfsError, Result};
use crate::hw::{Completion, HwStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default tick of an interruptible wait
pub const DEFAULT_WAIT_TICK: Duration = Duration::from_millis(10);

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interruption token, raised from any thread
///
/// A raised token aborts the next blocking wait of every handle using it.
/// The aborted wait lowers the token again.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// How a handle waits: blocking or not, with an optional timeout
#[derive(Debug, Clone, Default)]
pub struct Waiter {
    pub nonblock: bool,
    /// An expired timeout ends the wait like an interruption
    pub timeout: Option<Duration>,
    pub interrupt: Interrupt,
}

impl Waiter {
    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn nonblocking() -> Self {
        Self {
            nonblock: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Outcome of [`wait_until`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Ready,
    Interrupted,
}

/// Wait on `cond` until `done` holds for the guarded data
///
/// The guard is handed back in both outcomes so the caller can unwind
/// under the lock.
pub(crate) fn wait_until<'a, T, F>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    waiter: &Waiter,
    tick: Duration,
    mut done: F,
) -> (MutexGuard<'a, T>, Wake)
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = waiter.timeout.map(|t| Instant::now() + t);
    loop {
        if done(&mut guard) {
            return (guard, Wake::Ready);
        }
        if waiter.interrupt.take() {
            return (guard, Wake::Interrupted);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return (guard, Wake::Interrupted);
        }
        let (next, _) = cond
            .wait_timeout(guard, tick)
            .unwrap_or_else(PoisonError::into_inner);
        guard = next;
    }
}

/// Coarse per-session (or per-file) operation lock
///
/// Held across a whole multi-step protocol operation, including its
/// blocking waits. Structural fields stay behind their own short locks.
#[derive(Debug, Default)]
pub(crate) struct OpLock {
    held: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct OpGuard<'a> {
    lock: &'a OpLock,
}

impl OpLock {
    /// Acquire, failing `Busy` when contended in non-blocking mode
    pub(crate) fn acquire(&self, waiter: &Waiter, tick: Duration) -> Result<OpGuard<'_>> {
        let mut held = lock(&self.held);
        if waiter.nonblock {
            if *held {
                return Err(FfsError::Busy);
            }
            *held = true;
            return Ok(OpGuard { lock: self });
        }
        let (mut held, wake) = wait_until(&self.cond, held, waiter, tick, |held| !*held);
        if wake == Wake::Interrupted {
            return Err(FfsError::Interrupted);
        }
        *held = true;
        Ok(OpGuard { lock: self })
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.lock.held) = false;
        self.lock.cond.notify_one();
    }
}

/// Completion cell for one hardware request
///
/// The completion side only stores the result and notifies, so it is safe
/// to fire from a hardware callback.
#[derive(Debug, Default)]
pub(crate) struct Transfer {
    result: Mutex<Option<(Vec<u8>, HwStatus)>>,
    cond: Condvar,
}

impl Transfer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Callback that completes this transfer
    pub(crate) fn completion(self: &Arc<Self>) -> Completion {
        let transfer = self.clone();
        Box::new(move |buf, status| transfer.complete(buf, status))
    }

    fn complete(&self, buf: Vec<u8>, status: HwStatus) {
        *lock(&self.result) = Some((buf, status));
        self.cond.notify_all();
    }

    /// Whether the request completed with an error
    pub(crate) fn has_failed(&self) -> bool {
        matches!(&*lock(&self.result), Some((_, Err(_))))
    }

    /// Take the result if the request already completed
    pub(crate) fn try_take(&self) -> Option<(Vec<u8>, HwStatus)> {
        lock(&self.result).take()
    }

    /// Wait for completion and take the result
    ///
    /// `None` means the wait was interrupted; the request is still owned by
    /// the hardware.
    pub(crate) fn wait(&self, waiter: &Waiter, tick: Duration) -> Option<(Vec<u8>, HwStatus)> {
        let guard = lock(&self.result);
        let (mut guard, wake) = wait_until(&self.cond, guard, waiter, tick, |r| r.is_some());
        match wake {
            Wake::Ready => guard.take(),
            Wake::Interrupted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interrupt_aborts_wait() {
        let pair = (Mutex::new(false), Condvar::new());
        let waiter = Waiter::blocking();
        let interrupt = waiter.interrupt.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interrupt.raise();
        });
        let guard = lock(&pair.0);
        let (_guard, wake) = wait_until(&pair.1, guard, &waiter, DEFAULT_WAIT_TICK, |ready| *ready);
        handle.join().unwrap();
        assert_eq!(wake, Wake::Interrupted);
        assert!(!waiter.interrupt.is_raised());
    }

    #[test]
    fn test_timeout_ends_wait() {
        let pair = (Mutex::new(()), Condvar::new());
        let waiter = Waiter::blocking().with_timeout(Duration::from_millis(15));
        let started = Instant::now();
        let (_guard, wake) = wait_until(&pair.1, lock(&pair.0), &waiter, DEFAULT_WAIT_TICK, |_| false);
        assert_eq!(wake, Wake::Interrupted);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_op_lock_nonblocking_contention() {
        let op = OpLock::default();
        let guard = op.acquire(&Waiter::blocking(), DEFAULT_WAIT_TICK).unwrap();
        assert!(matches!(
            op.acquire(&Waiter::nonblocking(), DEFAULT_WAIT_TICK),
            Err(FfsError::Busy)
        ));
        drop(guard);
        assert!(op.acquire(&Waiter::nonblocking(), DEFAULT_WAIT_TICK).is_ok());
    }

    #[test]
    fn test_op_lock_hands_over() {
        let op = Arc::new(OpLock::default());
        let guard = op.acquire(&Waiter::blocking(), DEFAULT_WAIT_TICK).unwrap();
        let other = op.clone();
        let handle = thread::spawn(move || {
            let waiter = Waiter::blocking().with_timeout(Duration::from_secs(5));
            other.acquire(&waiter, DEFAULT_WAIT_TICK).map(|_| ())
        });
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_transfer_completion_from_other_thread() {
        let transfer = Transfer::new();
        let complete = transfer.completion();
        thread::spawn(move || complete(vec![1, 2, 3], Ok(3)));
        let waiter = Waiter::blocking().with_timeout(Duration::from_secs(5));
        let (buf, status) = transfer.wait(&waiter, DEFAULT_WAIT_TICK).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(status, Ok(3));
    }
}
