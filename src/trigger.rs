//! Trigger specification and start-time verification
//!
//! A trigger is a sequence of stages, each holding one or more channel
//! matches. The session verifies it before starting an acquisition;
//! evaluating it against sample data is the device's job.

use std::rc::Rc;
use tracing::{error, trace};

use crate::device::SignalChannel;
use crate::{Result, SessionError};

/// Condition a single channel is matched against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
    /// Analog level above the match value.
    Over,
    /// Analog level below the match value.
    Under,
}

/// One channel match within a stage.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub channel: Rc<SignalChannel>,
    pub kind: MatchKind,
    /// Level for the analog match kinds; unused for logic matches.
    pub value: Option<f32>,
}

/// One trigger stage; all its matches must hold for the stage to fire.
#[derive(Debug, Clone)]
pub struct TriggerStage {
    pub number: usize,
    pub matches: Vec<TriggerMatch>,
}

impl TriggerStage {
    pub fn add_match(&mut self, channel: Rc<SignalChannel>, kind: MatchKind) -> &mut Self {
        self.matches.push(TriggerMatch {
            channel,
            kind,
            value: None,
        });
        self
    }

    pub fn add_analog_match(
        &mut self,
        channel: Rc<SignalChannel>,
        kind: MatchKind,
        value: f32,
    ) -> &mut Self {
        self.matches.push(TriggerMatch {
            channel,
            kind,
            value: Some(value),
        });
        self
    }
}

/// A complete trigger specification.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pub name: Option<String>,
    pub stages: Vec<TriggerStage>,
}

impl Trigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            stages: Vec::new(),
        }
    }

    /// Append an empty stage and return it for match registration.
    pub fn add_stage(&mut self) -> &mut TriggerStage {
        let number = self.stages.len();
        self.stages.push(TriggerStage {
            number,
            matches: Vec::new(),
        });
        self.stages.last_mut().expect("stage just pushed")
    }

    /// Check that the spec is well-formed: at least one stage, and every
    /// stage has at least one match. The channel and match kind of each
    /// match are guaranteed by construction.
    pub(crate) fn verify(&self) -> Result<()> {
        if self.stages.is_empty() {
            error!("no trigger stages defined");
            return Err(SessionError::Trigger("no stages defined"));
        }

        trace!("checking trigger");
        for stage in &self.stages {
            if stage.matches.is_empty() {
                error!("stage {} has no matches defined", stage.number);
                return Err(SessionError::Trigger("stage has no matches defined"));
            }
            for m in &stage.matches {
                trace!(
                    "stage {} match on channel {}, match {:?}",
                    stage.number,
                    m.channel.name,
                    m.kind
                );
            }
        }

        Ok(())
    }
}
