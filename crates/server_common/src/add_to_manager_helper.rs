//! Registration handshake of a worker joining its manager.
//!
//! The helper sends the registration request and interprets the manager's
//! reply. An empty reply means "not ready yet": the helper waits a fixed
//! interval and asks again, up to `max_retries` times. Any transport failure
//! or reply timeout ends the attempt at once. When the handshake gives up it
//! stops the dispatch loop, exactly once.

use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use mercury::{Address, Incoming, InterfaceElement, MercuryError, Nub, TimerId};

/// Why joining the manager did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JoinError {
    /// The manager kept answering "not ready"
    #[error("Manager not ready after {attempts} attempts")]
    ManagerNotReady { attempts: u32 },
    /// The manager could not be reached
    #[error("Transport error: {0}")]
    Transport(#[from] MercuryError),
}

/// Retry settings of the join handshake.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between an empty reply and the next attempt
    pub retry_interval: Duration,
    /// Deadline of each request
    pub reply_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    WaitingReply,
    Joined,
    Aborted,
}

/// Outcome of an event handed to the helper.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinProgress {
    /// Not for this helper, or the helper already finished
    Ignored,
    /// Still waiting
    Pending,
    /// The manager accepted us; the reply carries our registration data
    Joined(Incoming),
    /// The handshake gave up and processing was stopped
    Aborted(JoinError),
}

/// Bounded-retry registration with a manager.
#[derive(Debug)]
pub struct AddToManagerHelper<A> {
    manager: Address,
    element: InterfaceElement,
    args: A,
    tag: u64,
    timer_arg: u64,
    config: JoinConfig,
    state: JoinState,
    retries: u32,
    timer: Option<TimerId>,
}

impl<A: Serialize> AddToManagerHelper<A> {
    /// Creates the helper.
    ///
    /// # Arguments
    ///
    /// * `manager` - Address of the manager
    /// * `element` - Registration request message
    /// * `args` - Registration request payload, resent on every attempt
    /// * `tag` - Reply tag of the registration requests
    /// * `timer_arg` - Argument of the retry timer
    pub fn new(
        manager: Address,
        element: InterfaceElement,
        args: A,
        tag: u64,
        timer_arg: u64,
        config: JoinConfig,
    ) -> Self {
        Self {
            manager,
            element,
            args,
            tag,
            timer_arg,
            config,
            state: JoinState::WaitingReply,
            retries: 0,
            timer: None,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn timer_arg(&self) -> u64 {
        self.timer_arg
    }

    /// Sends the first registration request.
    pub fn start(&mut self, nub: &mut Nub) -> Result<(), MercuryError> {
        info!("🤝 Registering with {} at {}", self.element.name, self.manager);
        self.send(nub)
    }

    fn send(&mut self, nub: &mut Nub) -> Result<(), MercuryError> {
        nub.send_request_with_timeout(
            self.manager,
            &self.element,
            &self.args,
            self.tag,
            self.config.reply_timeout,
        )?;
        Ok(())
    }

    fn abort(&mut self, nub: &mut Nub, error: JoinError) -> JoinProgress {
        error!("❌ Could not join {}: {}", self.manager, error);
        self.state = JoinState::Aborted;
        if let Some(timer) = self.timer.take() {
            nub.cancel_timer(timer);
        }
        nub.break_processing();
        JoinProgress::Aborted(error)
    }

    /// Handles the reply (or failure) of a registration request.
    pub fn handle_reply(
        &mut self,
        nub: &mut Nub,
        tag: u64,
        reply: Result<Incoming, MercuryError>,
    ) -> JoinProgress {
        if tag != self.tag || self.state != JoinState::WaitingReply {
            return JoinProgress::Ignored;
        }

        let message = match reply {
            Ok(message) => message,
            Err(e) => return self.abort(nub, JoinError::Transport(e)),
        };

        if !message.is_empty() {
            info!("✅ Joined manager at {}", self.manager);
            self.state = JoinState::Joined;
            return JoinProgress::Joined(message);
        }

        if self.retries >= self.config.max_retries {
            return self.abort(
                nub,
                JoinError::ManagerNotReady {
                    attempts: self.retries + 1,
                },
            );
        }

        self.retries += 1;
        warn!(
            "Manager at {} not ready, retrying in {:?} ({}/{})",
            self.manager, self.config.retry_interval, self.retries, self.config.max_retries
        );
        self.timer = Some(nub.register_timer(self.config.retry_interval, self.timer_arg));
        JoinProgress::Pending
    }

    /// Handles expiry of the retry timer.
    pub fn handle_timeout(&mut self, nub: &mut Nub, id: TimerId) -> JoinProgress {
        if self.timer != Some(id) || self.state != JoinState::WaitingReply {
            return JoinProgress::Ignored;
        }
        self.timer = None;
        debug!("Resending registration to {}", self.manager);
        match self.send(nub) {
            Ok(()) => JoinProgress::Pending,
            Err(e) => self.abort(nub, JoinError::Transport(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury::{FailureReason, NubConfig};

    const ADD: InterfaceElement = InterfaceElement::new(1, 0, "add");

    fn reply(payload: Vec<u8>) -> Incoming {
        Incoming {
            source: "10.0.0.9:4000".parse().unwrap(),
            interface: 0,
            method: 0,
            reply_id: Some(1),
            payload,
        }
    }

    fn setup(max_retries: u32) -> (Nub, AddToManagerHelper<u32>) {
        let nub = Nub::new("10.0.0.1:1000".parse().unwrap(), NubConfig::default());
        let helper = AddToManagerHelper::new(
            "10.0.0.9:4000".parse().unwrap(),
            ADD,
            7u32,
            11,
            12,
            JoinConfig {
                max_retries,
                ..Default::default()
            },
        );
        (nub, helper)
    }

    #[test]
    fn test_non_empty_reply_joins() {
        let (mut nub, mut helper) = setup(3);
        helper.start(&mut nub).unwrap();

        let progress = helper.handle_reply(&mut nub, 11, Ok(reply(vec![1, 0, 0, 0])));
        assert!(matches!(progress, JoinProgress::Joined(_)));
        assert_eq!(helper.state(), JoinState::Joined);
        assert!(!nub.processing_broken());
    }

    #[test]
    fn test_transport_failure_aborts_immediately() {
        let (mut nub, mut helper) = setup(3);
        helper.start(&mut nub).unwrap();

        let failure = MercuryError::TransportFailure {
            addr: "10.0.0.9:4000".parse().unwrap(),
            reason: FailureReason::NoAck,
        };
        let progress = helper.handle_reply(&mut nub, 11, Err(failure));
        assert!(matches!(progress, JoinProgress::Aborted(JoinError::Transport(_))));
        assert!(nub.processing_broken());
        assert_eq!(helper.retries(), 0);
    }

    #[test]
    fn test_empty_replies_exhaust_retries() {
        let (mut nub, mut helper) = setup(1);
        helper.start(&mut nub).unwrap();

        assert_eq!(helper.handle_reply(&mut nub, 11, Ok(reply(vec![]))), JoinProgress::Pending);
        let timer = helper.timer.unwrap();
        assert_eq!(helper.handle_reply(&mut nub, 99, Ok(reply(vec![]))), JoinProgress::Ignored);
        assert_eq!(helper.handle_timeout(&mut nub, timer), JoinProgress::Pending);

        let progress = helper.handle_reply(&mut nub, 11, Ok(reply(vec![])));
        assert_eq!(
            progress,
            JoinProgress::Aborted(JoinError::ManagerNotReady { attempts: 2 })
        );
        assert_eq!(helper.handle_reply(&mut nub, 11, Ok(reply(vec![]))), JoinProgress::Ignored);
        assert_eq!(helper.handle_timeout(&mut nub, timer), JoinProgress::Ignored);
    }

    #[test]
    fn test_transport_failure_after_retries_aborts_once() {
        let (mut nub, mut helper) = setup(3);
        helper.start(&mut nub).unwrap();

        let mut timers = Vec::new();
        for attempt in 1..=3 {
            assert_eq!(helper.handle_reply(&mut nub, 11, Ok(reply(vec![]))), JoinProgress::Pending);
            assert_eq!(helper.retries(), attempt);
            let timer = helper.timer.unwrap();
            timers.push(timer);
            assert_eq!(helper.handle_timeout(&mut nub, timer), JoinProgress::Pending);
        }
        assert!(!nub.processing_broken());

        let failure = MercuryError::TransportFailure {
            addr: "10.0.0.9:4000".parse().unwrap(),
            reason: FailureReason::NoAck,
        };
        let progress = helper.handle_reply(&mut nub, 11, Err(failure.clone()));
        assert_eq!(progress, JoinProgress::Aborted(JoinError::Transport(failure.clone())));
        assert_eq!(helper.state(), JoinState::Aborted);
        assert_eq!(nub.stats().break_requests, 1);

        // Nothing after the abort is acted on
        assert_eq!(helper.handle_reply(&mut nub, 11, Ok(reply(vec![1]))), JoinProgress::Ignored);
        assert_eq!(helper.handle_reply(&mut nub, 11, Err(failure)), JoinProgress::Ignored);
        for timer in timers {
            assert_eq!(helper.handle_timeout(&mut nub, timer), JoinProgress::Ignored);
        }
        assert_eq!(helper.state(), JoinState::Aborted);
        assert_eq!(nub.stats().break_requests, 1);
    }
}
