//! # Controlled Shutdown
//!
//! A controlled shutdown walks every BaseApp through a fixed sequence of
//! stages. Each stage is broadcast, then the manager waits for every
//! participant to acknowledge it. Participants that do not answer before the
//! stage timeout are logged as failed and the sequence moves on anyway.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use mercury::{Address, TimerId};

/// Stage of a controlled shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShutDownStage {
    /// No shutdown in progress
    None,
    /// BaseApps stop accepting new work
    Request,
    /// Client proxies are disconnected
    DisconnectProxies,
    /// Entities are written out and processes stop
    Perform,
    /// Everything acknowledged or timed out
    Finished,
}

impl ShutDownStage {
    /// Stage following this one.
    pub fn next(self) -> ShutDownStage {
        match self {
            ShutDownStage::None => ShutDownStage::Request,
            ShutDownStage::Request => ShutDownStage::DisconnectProxies,
            ShutDownStage::DisconnectProxies => ShutDownStage::Perform,
            ShutDownStage::Perform | ShutDownStage::Finished => ShutDownStage::Finished,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ShutDownStage::None | ShutDownStage::Finished)
    }
}

impl fmt::Display for ShutDownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutDownStage::None => "none",
            ShutDownStage::Request => "request",
            ShutDownStage::DisconnectProxies => "disconnect proxies",
            ShutDownStage::Perform => "perform",
            ShutDownStage::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Tracks which participants still owe an acknowledgement for the current stage.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    stage: ShutDownStage,
    awaiting: BTreeSet<Address>,
    timer: Option<TimerId>,
    failed: Vec<(ShutDownStage, Address)>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            stage: ShutDownStage::None,
            awaiting: BTreeSet::new(),
            timer: None,
            failed: Vec::new(),
        }
    }

    pub fn stage(&self) -> ShutDownStage {
        self.stage
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stage != ShutDownStage::None
    }

    /// Enters `stage`, expecting an acknowledgement from each participant.
    pub fn begin(&mut self, stage: ShutDownStage, participants: impl IntoIterator<Item = Address>) {
        self.stage = stage;
        self.awaiting = participants.into_iter().collect();
        self.timer = None;
    }

    pub fn set_timer(&mut self, timer: TimerId) {
        self.timer = Some(timer);
    }

    /// Takes the stage timer, if it is `id`.
    pub fn take_timer_if(&mut self, id: TimerId) -> bool {
        if self.timer == Some(id) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    pub fn take_timer(&mut self) -> Option<TimerId> {
        self.timer.take()
    }

    /// Records an acknowledgement.
    ///
    /// Returns `true` when this acknowledgement completed the stage.
    /// Acknowledgements of other stages or from unknown senders are ignored.
    pub fn ack(&mut self, from: Address, stage: ShutDownStage) -> bool {
        if stage != self.stage || !self.stage.is_active() {
            return false;
        }
        self.awaiting.remove(&from) && self.awaiting.is_empty()
    }

    /// Stops waiting for a participant that went away.
    ///
    /// Returns `true` when the stage is complete as a result.
    pub fn forget(&mut self, addr: Address) -> bool {
        self.stage.is_active() && self.awaiting.remove(&addr) && self.awaiting.is_empty()
    }

    pub fn is_stage_complete(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// Gives up on the current stage and returns who did not answer.
    pub fn expire(&mut self) -> Vec<Address> {
        let missing: Vec<Address> = std::mem::take(&mut self.awaiting).into_iter().collect();
        for addr in &missing {
            self.failed.push((self.stage, *addr));
        }
        missing
    }

    /// Participants that missed a stage deadline so far.
    pub fn failed(&self) -> &[(ShutDownStage, Address)] {
        &self.failed
    }

    pub fn awaiting(&self) -> impl Iterator<Item = &Address> {
        self.awaiting.iter()
    }
}
