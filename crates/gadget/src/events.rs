//! Bounded control-event queue and setup sub-state
//!
//! Every enqueue collapses superseded entries before pushing, which keeps
//! the queue at four entries or fewer: one lifecycle event, one SETUP and
//! at most one SUSPEND/RESUME pair.

use protocol::{ControlEvent, EventType, SetupPacket};
use serde::Serialize;
use tracing::{error, trace};

/// Queue capacity
pub const EVENT_QUEUE_CAPACITY: usize = 4;

/// Progress of the outstanding control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetupState {
    NoSetup,
    /// `delivered` is set once a reader has consumed the SETUP event
    Pending { delivered: bool },
    /// Superseded; the next control-channel operation reports it
    Cancelled,
}

#[derive(Debug)]
pub struct EventQueue {
    kinds: heapless::Vec<EventType, EVENT_QUEUE_CAPACITY>,
    setup: SetupPacket,
    state: SetupState,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            kinds: heapless::Vec::new(),
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            state: SetupState::NoSetup,
        }
    }

    /// Queue `kind`, cancelling and purging what it supersedes
    pub fn push(&mut self, kind: EventType) {
        match self.state {
            SetupState::Pending { delivered: true } => self.state = SetupState::Cancelled,
            SetupState::Pending { delivered: false } if kind == EventType::Setup => {
                self.state = SetupState::Cancelled
            }
            _ => {}
        }

        self.kinds.retain(|&queued| !supersedes(kind, queued));
        if self.state == (SetupState::Pending { delivered: false })
            && !self.kinds.contains(&EventType::Setup)
        {
            self.state = SetupState::NoSetup;
        }

        if let Err(kind) = self.kinds.push(kind) {
            error!("Event queue overflow, dropping oldest for {:?}", kind);
            self.kinds.remove(0);
            let _ = self.kinds.push(kind);
        }
        trace!("Queued {:?}: {:?}", kind, self.kinds);
    }

    /// Record an incoming control request and queue its SETUP event
    pub fn push_setup(&mut self, packet: SetupPacket) {
        self.push(EventType::Setup);
        self.setup = packet;
        if self.state != SetupState::Cancelled {
            self.state = SetupState::Pending { delivered: false };
        }
    }

    /// Dequeue up to `max` events
    ///
    /// Delivering a SETUP event marks the request delivered.
    pub fn pop(&mut self, max: usize) -> Vec<ControlEvent> {
        let n = max.min(self.kinds.len());
        let mut events = Vec::with_capacity(n);
        for _ in 0..n {
            let kind = self.kinds.remove(0);
            if kind == EventType::Setup {
                events.push(ControlEvent::setup(self.setup));
                self.state = SetupState::Pending { delivered: true };
            } else {
                events.push(ControlEvent::new(kind));
            }
        }
        events
    }

    /// Clear a cancellation, returning the state seen before
    pub fn clear_cancelled(&mut self) -> SetupState {
        let before = self.state;
        if before == SetupState::Cancelled {
            self.state = self.idle_state();
        }
        before
    }

    /// The delivered request finished or was stalled
    pub fn finish_setup(&mut self) {
        self.state = self.idle_state();
    }

    fn idle_state(&self) -> SetupState {
        if self.kinds.contains(&EventType::Setup) {
            SetupState::Pending { delivered: false }
        } else {
            SetupState::NoSetup
        }
    }

    pub fn setup_state(&self) -> SetupState {
        self.state
    }

    /// Packet of the latest control request
    pub fn setup(&self) -> SetupPacket {
        self.setup
    }

    pub fn kinds(&self) -> &[EventType] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn clear(&mut self) {
        self.kinds.clear();
        self.state = SetupState::NoSetup;
    }
}

/// Whether adding `added` removes an already queued `queued`
fn supersedes(added: EventType, queued: EventType) -> bool {
    match added {
        EventType::Resume => queued.is_power(),
        EventType::Suspend => queued == EventType::Suspend,
        EventType::Setup => queued == EventType::Setup,
        EventType::Bind | EventType::Unbind | EventType::Enable | EventType::Disable => {
            !queued.is_power()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(request: u8) -> SetupPacket {
        SetupPacket {
            request_type: 0xc1,
            request,
            value: 0,
            index: 0,
            length: 4,
        }
    }

    #[test]
    fn test_resume_purges_suspend() {
        let mut queue = EventQueue::new();
        queue.push(EventType::Suspend);
        queue.push(EventType::Resume);
        assert_eq!(queue.kinds(), &[EventType::Resume]);
    }

    #[test]
    fn test_lifecycle_keeps_power_events() {
        let mut queue = EventQueue::new();
        queue.push(EventType::Bind);
        queue.push(EventType::Resume);
        queue.push(EventType::Suspend);
        queue.push(EventType::Enable);
        assert_eq!(
            queue.kinds(),
            &[EventType::Resume, EventType::Suspend, EventType::Enable]
        );
    }

    #[test]
    fn test_second_setup_cancels_first() {
        let mut queue = EventQueue::new();
        queue.push_setup(packet(1));
        let events = queue.pop(4);
        assert_eq!(events[0].setup, Some(packet(1)));
        assert_eq!(queue.setup_state(), SetupState::Pending { delivered: true });

        queue.push_setup(packet(2));
        assert_eq!(queue.setup_state(), SetupState::Cancelled);
        assert_eq!(queue.clear_cancelled(), SetupState::Cancelled);
        assert_eq!(queue.setup_state(), SetupState::Pending { delivered: false });

        let events = queue.pop(4);
        assert_eq!(events[0].setup, Some(packet(2)));
    }

    #[test]
    fn test_lifecycle_event_drops_undelivered_setup() {
        let mut queue = EventQueue::new();
        queue.push_setup(packet(1));
        queue.push(EventType::Disable);
        assert_eq!(queue.kinds(), &[EventType::Disable]);
        assert_eq!(queue.setup_state(), SetupState::NoSetup);
    }

    #[test]
    fn test_power_event_cancels_delivered_setup() {
        let mut queue = EventQueue::new();
        queue.push_setup(packet(1));
        queue.pop(1);
        queue.push(EventType::Suspend);
        assert_eq!(queue.setup_state(), SetupState::Cancelled);
        assert_eq!(queue.clear_cancelled(), SetupState::Cancelled);
        assert_eq!(queue.setup_state(), SetupState::NoSetup);
    }

    #[test]
    fn test_pop_respects_max() {
        let mut queue = EventQueue::new();
        queue.push(EventType::Bind);
        queue.push(EventType::Suspend);
        let first = queue.pop(1);
        assert_eq!(first[0].kind, EventType::Bind);
        assert_eq!(queue.len(), 1);
    }

    fn any_event() -> impl Strategy<Value = EventType> {
        (0u8..7).prop_map(|n| EventType::from_u8(n).unwrap())
    }

    proptest! {
        #[test]
        fn prop_queue_stays_bounded(events in prop::collection::vec((any_event(), any::<bool>()), 0..64)) {
            let mut queue = EventQueue::new();
            for (kind, read) in events {
                if kind == EventType::Setup {
                    queue.push_setup(packet(0));
                } else {
                    queue.push(kind);
                }
                prop_assert!(queue.len() <= EVENT_QUEUE_CAPACITY);

                let kinds = queue.kinds();
                for unique in [EventType::Setup, EventType::Suspend, EventType::Resume] {
                    prop_assert!(kinds.iter().filter(|&&k| k == unique).count() <= 1);
                }
                let lifecycle = kinds.iter().filter(|k| !k.is_power() && **k != EventType::Setup).count();
                prop_assert!(lifecycle <= 1);
                // A resume is never followed by the suspend it superseded
                if let Some(resume) = kinds.iter().position(|&k| k == EventType::Resume) {
                    prop_assert!(!kinds[..resume].contains(&EventType::Suspend));
                }

                if read {
                    queue.clear_cancelled();
                    queue.pop(1);
                }
            }
        }

        #[test]
        fn prop_setup_never_double_pending(reads in prop::collection::vec(any::<bool>(), 1..16)) {
            let mut queue = EventQueue::new();
            for (n, read) in reads.into_iter().enumerate() {
                let before = queue.setup_state();
                queue.push_setup(packet(n as u8));
                if matches!(before, SetupState::Pending { .. }) {
                    prop_assert_eq!(queue.setup_state(), SetupState::Cancelled);
                }
                if read {
                    queue.clear_cancelled();
                    let events = queue.pop(4);
                    prop_assert_eq!(events.last().and_then(|e| e.setup), Some(packet(n as u8)));
                }
            }
        }
    }
}
