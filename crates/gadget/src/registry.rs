//! Named function instances
//!
//! The registry maps instance names to their sessions and owns the work
//! queue that every session's deferred completions run on. An entry goes
//! away only once the instance has been removed *and* its session has no
//! open handles; both paths check this explicitly.

use crate::control::ControlChannel;
use crate::error::{FfsError, Result};
use crate::hw::{Binder, ChannelHost};
use crate::session::{Session, SessionEnv, SessionOptions};
use crate::sync::{Waiter, lock};
use common::WorkQueue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Longest accepted instance name, in bytes
pub const MAX_INSTANCE_NAME_LEN: usize = 40;

#[derive(Clone, Default)]
pub struct InstanceOptions {
    pub no_disconnect: bool,
    pub binder: Option<Arc<dyn Binder>>,
}

impl std::fmt::Debug for InstanceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOptions")
            .field("no_disconnect", &self.no_disconnect)
            .field("binder", &self.binder.is_some())
            .finish()
    }
}

struct Instance {
    options: InstanceOptions,
    session: Option<Arc<Session>>,
    removed: bool,
}

pub(crate) struct RegistryShared {
    host: Arc<dyn ChannelHost>,
    work: WorkQueue,
    wait_tick: Duration,
    instances: Mutex<HashMap<String, Instance>>,
}

impl RegistryShared {
    /// Drop the entry of a removed session once nothing holds it open
    pub(crate) fn reap(&self, session: &Arc<Session>) {
        let mut instances = lock(&self.instances);
        let reapable = instances.get(session.name()).is_some_and(|instance| {
            instance.removed
                && instance
                    .session
                    .as_ref()
                    .is_some_and(|s| Arc::ptr_eq(s, session))
        });
        if reapable && session.open_count() == 0 {
            instances.remove(session.name());
            info!("Instance {} released", session.name());
        }
    }
}

/// Table of function instances
pub struct Registry {
    shared: Arc<RegistryShared>,
}

impl Registry {
    pub fn new(host: Arc<dyn ChannelHost>, work: WorkQueue, wait_tick: Duration) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                host,
                work,
                wait_tick,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn create_instance(&self, name: &str, options: InstanceOptions) -> Result<()> {
        if name.is_empty() {
            return Err(FfsError::InvalidArgument("empty instance name"));
        }
        if name.len() > MAX_INSTANCE_NAME_LEN {
            return Err(FfsError::InvalidArgument("instance name too long"));
        }
        let mut instances = lock(&self.shared.instances);
        if instances.contains_key(name) {
            return Err(FfsError::Busy);
        }
        debug!("Created instance {} ({:?})", name, options);
        instances.insert(
            name.to_string(),
            Instance {
                options,
                session: None,
                removed: false,
            },
        );
        Ok(())
    }

    /// Open the control channel of instance `name`
    ///
    /// The session is created on the first open.
    pub fn open_control(&self, name: &str, waiter: Waiter) -> Result<ControlChannel> {
        let mut instances = lock(&self.shared.instances);
        let instance = instances
            .get_mut(name)
            .filter(|instance| !instance.removed)
            .ok_or(FfsError::DeviceGone)?;

        let session = match &instance.session {
            Some(session) => session.clone(),
            None => {
                let env = SessionEnv {
                    host: self.shared.host.clone(),
                    binder: instance.options.binder.clone(),
                    work: self.shared.work.clone(),
                    registry: Arc::downgrade(&self.shared),
                };
                let options = SessionOptions {
                    no_disconnect: instance.options.no_disconnect,
                    wait_tick: self.shared.wait_tick,
                };
                let session = Session::new(name, options, env);
                instance.session = Some(session.clone());
                session
            }
        };
        drop(instances);
        ControlChannel::open(session, waiter)
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        lock(&self.shared.instances)
            .get(name)
            .and_then(|instance| instance.session.clone())
    }

    /// Remove instance `name`
    ///
    /// Open handles keep the entry until they close; every further
    /// operation on them fails `DeviceGone`.
    pub fn remove_instance(&self, name: &str) -> Result<()> {
        let mut instances = lock(&self.shared.instances);
        let instance = instances
            .get_mut(name)
            .filter(|instance| !instance.removed)
            .ok_or(FfsError::DeviceGone)?;
        instance.removed = true;

        let idle = match &instance.session {
            Some(session) => {
                session.mark_removed();
                session.open_count() == 0
            }
            None => true,
        };
        if idle {
            instances.remove(name);
            info!("Instance {} removed", name);
        } else {
            info!("Instance {} removed, waiting for handles to close", name);
        }
        Ok(())
    }

    /// Names of registered instances, sorted
    pub fn instances(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.instances).keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::MemoryHost;
    use crate::session::SessionState;
    use crate::sync::DEFAULT_WAIT_TICK;
    use common::create_work_queue;

    fn registry() -> Registry {
        let (work, _runner) = create_work_queue(4);
        Registry::new(Arc::new(MemoryHost::new()), work, DEFAULT_WAIT_TICK)
    }

    #[test]
    fn test_duplicate_instance_is_busy() {
        let registry = registry();
        registry.create_instance("usb0", InstanceOptions::default()).unwrap();
        assert!(matches!(
            registry.create_instance("usb0", InstanceOptions::default()),
            Err(FfsError::Busy)
        ));
    }

    #[test]
    fn test_instance_name_limits() {
        let registry = registry();
        let long = "x".repeat(MAX_INSTANCE_NAME_LEN + 1);
        assert!(matches!(
            registry.create_instance(&long, InstanceOptions::default()),
            Err(FfsError::InvalidArgument(_))
        ));
        assert!(
            registry
                .create_instance(&long[..MAX_INSTANCE_NAME_LEN], InstanceOptions::default())
                .is_ok()
        );
    }

    #[test]
    fn test_open_unknown_instance() {
        let registry = registry();
        assert!(matches!(
            registry.open_control("missing", Waiter::blocking()),
            Err(FfsError::DeviceGone)
        ));
    }

    #[test]
    fn test_open_creates_session_once() {
        let registry = registry();
        registry.create_instance("usb0", InstanceOptions::default()).unwrap();
        assert!(registry.session("usb0").is_none());

        let control = registry.open_control("usb0", Waiter::blocking()).unwrap();
        let session = registry.session("usb0").unwrap();
        assert_eq!(session.state(), SessionState::CollectingDescriptors);
        assert!(matches!(
            registry.open_control("usb0", Waiter::blocking()),
            Err(FfsError::Busy)
        ));

        drop(control);
        let _again = registry.open_control("usb0", Waiter::blocking()).unwrap();
        assert!(Arc::ptr_eq(&session, &registry.session("usb0").unwrap()));
    }

    #[test]
    fn test_removal_waits_for_last_close() {
        let registry = registry();
        registry.create_instance("usb0", InstanceOptions::default()).unwrap();
        let control = registry.open_control("usb0", Waiter::blocking()).unwrap();

        registry.remove_instance("usb0").unwrap();
        assert_eq!(registry.instances(), vec!["usb0".to_string()]);
        assert_eq!(control.session().check_alive(), Err(FfsError::DeviceGone));

        drop(control);
        assert!(registry.instances().is_empty());
        assert!(registry.create_instance("usb0", InstanceOptions::default()).is_ok());
    }

    #[test]
    fn test_remove_idle_instance() {
        let registry = registry();
        registry.create_instance("usb0", InstanceOptions::default()).unwrap();
        registry.remove_instance("usb0").unwrap();
        assert!(registry.instances().is_empty());
        assert!(matches!(registry.remove_instance("usb0"), Err(FfsError::DeviceGone)));
    }
}
