//! Session aggregate: device membership, lifecycle and the datafeed bus
//!
//! A session owns everything an acquisition needs: the attached devices,
//! the event-source registry driving them, the transform chain and the
//! subscriber callbacks receiving their packets. Apart from the shared
//! stop flag, a session lives on a single thread: all source callbacks,
//! transforms and subscribers run on the thread that called [`Session::run`].

pub mod clock;
mod event_loop;
pub mod poll;
pub mod source;
pub mod stop;

pub use poll::PollDesc;
pub use source::{SourceCallback, SourceKey};
pub use stop::StopHandle;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, trace};

use crate::context::Context;
use crate::datafeed::transform::Transform;
use crate::datafeed::{self, DatafeedCallback, Packet};
use crate::device::Device;
use crate::trigger::Trigger;
use crate::{Result, SessionError};

use source::Source;
use stop::StopState;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// An acquisition session.
pub struct Session {
    /// Unique per process; devices point back at their session by id.
    id: u64,
    ctx: Rc<Context>,
    devs: RefCell<Vec<Rc<Device>>>,
    /// Devices the session itself allocated, released at teardown.
    owned_devs: RefCell<Vec<Rc<Device>>>,
    subscribers: RefCell<Vec<Rc<RefCell<DatafeedCallback>>>>,
    transforms: RefCell<Vec<Box<dyn Transform>>>,
    trigger: RefCell<Option<Trigger>>,
    sources: RefCell<Vec<Source>>,
    next_token: Cell<u64>,
    stop: Arc<Mutex<StopState>>,
}

impl Session {
    /// Create a new session in the given context.
    pub fn new(ctx: Rc<Context>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            devs: RefCell::new(Vec::new()),
            owned_devs: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            transforms: RefCell::new(Vec::new()),
            trigger: RefCell::new(None),
            sources: RefCell::new(Vec::new()),
            next_token: Cell::new(0),
            stop: Arc::new(Mutex::new(StopState::default())),
        }
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    /// Attach a device instance to this session.
    ///
    /// When the session is already running, the device's configuration is
    /// committed and its acquisition started immediately so it joins the
    /// current run.
    pub fn dev_add(&self, device: &Rc<Device>) -> Result<()> {
        if device.session_id().is_some() {
            error!("device {} already assigned to a session", device.display_name());
            return Err(SessionError::Arg("device is already attached to a session"));
        }

        self.devs.borrow_mut().push(Rc::clone(device));
        device.attach(self.id);

        let driver = match device.driver() {
            Some(driver) => Rc::clone(driver),
            // A device with no driver is virtual; just attach it.
            None => return Ok(()),
        };

        if self.is_running() {
            if let Err(err) = driver.config_commit(device) {
                error!(
                    "failed to commit device settings before starting acquisition \
                     in running session ({})",
                    err
                );
                return Err(err);
            }
            if let Err(err) = driver.acquisition_start(self, device) {
                error!(
                    "failed to start acquisition of device in running session ({})",
                    err
                );
                return Err(err);
            }
        }

        Ok(())
    }

    /// Attach a device the session is to own; it is released when the
    /// session is destroyed.
    pub fn dev_add_owned(&self, device: Rc<Device>) -> Result<()> {
        self.dev_add(&device)?;
        self.owned_devs.borrow_mut().push(device);
        Ok(())
    }

    /// Detach all devices. The devices themselves survive; only their
    /// session membership is cleared.
    pub fn dev_remove_all(&self) {
        for device in self.devs.borrow().iter() {
            device.detach();
        }
        self.devs.borrow_mut().clear();
    }

    /// All devices attached to this session, in attach order.
    pub fn dev_list(&self) -> Vec<Rc<Device>> {
        self.devs.borrow().clone()
    }

    /// Assign the trigger for this session; `None` clears it.
    pub fn trigger_set(&self, trigger: Option<Trigger>) {
        *self.trigger.borrow_mut() = trigger;
    }

    /// The trigger assigned to this session, if any.
    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger.borrow().clone()
    }

    /// Register a subscriber invoked for every packet that survives the
    /// transform chain.
    pub fn datafeed_callback_add<F>(&self, cb: F)
    where
        F: FnMut(&Rc<Device>, &Packet) + 'static,
    {
        self.subscribers.borrow_mut().push(Rc::new(RefCell::new(cb)));
    }

    pub fn datafeed_callback_remove_all(&self) {
        self.subscribers.borrow_mut().clear();
    }

    /// Append a transform stage; stages run in registration order.
    pub fn transform_add(&self, transform: Box<dyn Transform>) {
        self.transforms.borrow_mut().push(transform);
    }

    pub fn transform_remove_all(&self) {
        self.transforms.borrow_mut().clear();
    }

    /// Send a packet from `device` onto the datafeed bus: through every
    /// transform in order, then to every subscriber in order.
    ///
    /// The caller keeps ownership of the packet; transforms produce fresh
    /// packets where they rewrite.
    pub fn send(&self, device: &Rc<Device>, packet: &Packet) -> Result<()> {
        if device.session_id() != Some(self.id) {
            error!("device {} is not attached to this session", device.display_name());
            return Err(SessionError::Bug("device is not attached to this session"));
        }

        let mut rewritten: Option<Packet> = None;
        {
            let mut transforms = self.transforms.borrow_mut();
            for transform in transforms.iter_mut() {
                trace!("running transform module '{}'", transform.id());
                let input = rewritten.as_ref().unwrap_or(packet);
                match transform.receive(input) {
                    Ok(Some(output)) => rewritten = Some(output),
                    Ok(None) => {
                        // A stage may swallow the packet; delivery simply
                        // ends here.
                        trace!(
                            "transform module '{}' returned no packet, aborting",
                            transform.id()
                        );
                        return Ok(());
                    }
                    Err(err) => {
                        error!(
                            "error while running transform module '{}': {}",
                            transform.id(),
                            err
                        );
                        return Err(err);
                    }
                }
            }
        }
        let outgoing = rewritten.as_ref().unwrap_or(packet);

        datafeed::dump(outgoing);

        // Walk a snapshot so a subscriber may change the registration list.
        let subscribers: Vec<Rc<RefCell<DatafeedCallback>>> =
            self.subscribers.borrow().iter().map(Rc::clone).collect();
        for cb in subscribers {
            (&mut *cb.borrow_mut())(device, outgoing);
        }

        Ok(())
    }

    /// Start the session: verify the trigger, then commit configuration
    /// and start acquisition on every attached device in order.
    ///
    /// Returns the first failure. Devices started before the failure are
    /// left running; stopping the session unwinds them.
    pub fn start(&self) -> Result<()> {
        if self.devs.borrow().is_empty() {
            error!("a session cannot be started without devices");
            return Err(SessionError::NoDevices);
        }

        if let Some(trigger) = self.trigger.borrow().as_ref() {
            trigger.verify()?;
        }

        info!("starting");

        let devs: Vec<Rc<Device>> = self.devs.borrow().clone();
        for device in &devs {
            if !device.has_enabled_channel() {
                error!("{} has no enabled channels", device.display_name());
                return Err(SessionError::NoEnabledChannels(device.display_name()));
            }
            let driver = match device.driver() {
                Some(driver) => Rc::clone(driver),
                None => continue,
            };
            if let Err(err) = driver.config_commit(device) {
                error!(
                    "failed to commit device settings before starting acquisition ({})",
                    err
                );
                return Err(err);
            }
            if let Err(err) = driver.acquisition_start(self, device) {
                error!("could not start an acquisition ({})", err);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Ask the session to stop from its own thread (typically from inside
    /// a source callback). Foreign threads use a [`StopHandle`] instead.
    ///
    /// Stopping is cooperative and non-blocking: the request takes effect
    /// at the next callback boundary of the running event loop.
    pub fn stop(&self) {
        self.stop.lock().unwrap().abort = true;
    }

    /// A cloneable handle other threads may use to request a stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.stop))
    }

    /// Whether [`Session::run`] is currently executing.
    pub fn is_running(&self) -> bool {
        self.stop.lock().unwrap().running
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.stop.lock().unwrap().running = running;
    }

    /// Synchronous stop path, executed on the session thread once a stop
    /// request is observed: stop acquisition on every device that has a
    /// driver, then clear the running flag.
    pub(crate) fn stop_sync(&self) {
        info!("stopping");

        let devs: Vec<Rc<Device>> = self.devs.borrow().clone();
        for device in &devs {
            if let Some(driver) = device.driver() {
                let driver = Rc::clone(driver);
                if let Err(err) = driver.acquisition_stop(self, device) {
                    error!(
                        "failed to stop acquisition of {} ({})",
                        device.display_name(),
                        err
                    );
                }
            }
        }
        self.set_running(false);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dev_remove_all();
    }
}
