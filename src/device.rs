//! Device instances and the driver seam
//!
//! The session core treats acquisition hardware as opaque: a [`Device`]
//! carries its signal channels and an optional [`Driver`], and the session
//! only ever calls the driver's config-commit and acquisition entry points.
//! A device without a driver is virtual (for example one reconstructed from
//! a capture file) and is attached without any driver interaction.

use std::cell::Cell;
use std::rc::Rc;

use crate::session::Session;
use crate::Result;

/// What a signal channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Logic,
    Analog,
}

/// One probe or channel on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalChannel {
    pub index: u32,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub name: String,
}

impl SignalChannel {
    pub fn new(index: u32, kind: ChannelKind, enabled: bool, name: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            enabled,
            name: name.into(),
        }
    }
}

/// Driver entry points the session core consumes.
///
/// `acquisition_start` and `acquisition_stop` receive the session so the
/// driver can register and remove its event sources and feed packets into
/// the datafeed bus.
pub trait Driver {
    fn name(&self) -> &str;

    /// Open the device for use. Invoked by the discovery layer before a
    /// device reaches a session; the session core itself never calls it.
    fn dev_open(&self, device: &Rc<Device>) -> Result<()>;

    /// Commit pending configuration to the hardware. Drivers without
    /// deferred configuration keep the default no-op.
    fn config_commit(&self, _device: &Rc<Device>) -> Result<()> {
        Ok(())
    }

    fn acquisition_start(&self, session: &Session, device: &Rc<Device>) -> Result<()>;

    /// Optional; drivers that need no teardown keep the default no-op.
    fn acquisition_stop(&self, _session: &Session, _device: &Rc<Device>) -> Result<()> {
        Ok(())
    }
}

/// An acquisition device instance.
pub struct Device {
    driver: Option<Rc<dyn Driver>>,
    vendor: Option<String>,
    model: Option<String>,
    connection_id: Option<String>,
    channels: Vec<Rc<SignalChannel>>,
    /// Id of the owning session, if attached. Kept consistent with the
    /// session's device list; a device belongs to at most one session.
    session: Cell<Option<u64>>,
}

impl Device {
    pub fn new(driver: Option<Rc<dyn Driver>>, channels: Vec<SignalChannel>) -> Rc<Self> {
        Rc::new(Self {
            driver,
            vendor: None,
            model: None,
            connection_id: None,
            channels: channels.into_iter().map(Rc::new).collect(),
            session: Cell::new(None),
        })
    }

    /// Construct with vendor/model/connection metadata, as produced by a
    /// driver's scan.
    pub fn with_identity(
        driver: Option<Rc<dyn Driver>>,
        channels: Vec<SignalChannel>,
        vendor: impl Into<String>,
        model: impl Into<String>,
        connection_id: Option<String>,
    ) -> Rc<Self> {
        Rc::new(Self {
            driver,
            vendor: Some(vendor.into()),
            model: Some(model.into()),
            connection_id,
            channels: channels.into_iter().map(Rc::new).collect(),
            session: Cell::new(None),
        })
    }

    pub fn driver(&self) -> Option<&Rc<dyn Driver>> {
        self.driver.as_ref()
    }

    pub fn channels(&self) -> &[Rc<SignalChannel>] {
        &self.channels
    }

    /// Id of the session this device is attached to, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.session.get()
    }

    pub(crate) fn attach(&self, session_id: u64) {
        self.session.set(Some(session_id));
    }

    pub(crate) fn detach(&self) {
        self.session.set(None);
    }

    pub(crate) fn has_enabled_channel(&self) -> bool {
        self.channels.iter().any(|ch| ch.enabled)
    }

    /// Human-readable name for log and error messages.
    pub fn display_name(&self) -> String {
        let base = match (&self.vendor, &self.model) {
            (Some(vendor), Some(model)) => format!("{} {}", vendor, model),
            _ => match &self.driver {
                Some(driver) => driver.name().to_string(),
                None => "virtual device".to_string(),
            },
        };
        match &self.connection_id {
            Some(conn) => format!("{} using connection {}", base, conn),
            None => base,
        }
    }
}
