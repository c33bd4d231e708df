//! # Anonymous Channel Client
//!
//! Locates a singleton service by interface name and keeps a channel pointed
//! at it. The service is found through the birth protocol: the client
//! listens for births of the interface and broadcasts a query, retrying a
//! bounded number of times.
//!
//! The client does not own any callbacks. The process forwards the Nub
//! events that carry the client's listener tag or timer to
//! [`AnonymousChannelClient::handle_birth`] and
//! [`AnonymousChannelClient::handle_timeout`].

use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use mercury::{
    Address, Announcement, ChannelOwner, InterfaceElement, ListenerTag, MercuryError, Nub,
    TimerId,
};

/// Where the client is in locating its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unresolved,
    Resolving,
    Bound,
    Failed,
}

/// Outcome of a lookup event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupProgress {
    /// The event did not belong to this client or changed nothing
    Ignored,
    /// Another query went out
    Retrying,
    /// The service was found (or moved) at this address
    Bound(Address),
    /// All attempts were used up
    Failed,
}

/// Lookup settings.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Attempts made before giving up
    pub num_retries: u32,
    /// Time to wait for an answer to each query
    pub lookup_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            num_retries: 5,
            lookup_timeout: Duration::from_secs(1),
        }
    }
}

/// Channel to a named singleton service whose address is discovered at runtime.
#[derive(Debug)]
pub struct AnonymousChannelClient {
    interface_name: String,
    listener_tag: ListenerTag,
    timer_arg: u64,
    config: LookupConfig,
    state: ClientState,
    owner: Option<ChannelOwner>,
    attempts: u32,
    timer: Option<TimerId>,
}

impl AnonymousChannelClient {
    /// Creates an unresolved client.
    ///
    /// # Arguments
    ///
    /// * `interface_name` - Interface the service announces, e.g. `"DBMgrInterface"`
    /// * `listener_tag` - Tag under which the birth listener is registered
    /// * `timer_arg` - Argument of the lookup timer
    pub fn new(
        interface_name: &str,
        listener_tag: ListenerTag,
        timer_arg: u64,
        config: LookupConfig,
    ) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            listener_tag,
            timer_arg,
            config,
            state: ClientState::Unresolved,
            owner: None,
            attempts: 0,
            timer: None,
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn listener_tag(&self) -> ListenerTag {
        self.listener_tag
    }

    pub fn timer_arg(&self) -> u64 {
        self.timer_arg
    }

    /// Address of the service, once bound.
    pub fn service_addr(&self) -> Option<Address> {
        self.owner.as_ref().map(ChannelOwner::addr)
    }

    pub fn channel(&self) -> Option<&ChannelOwner> {
        self.owner.as_ref()
    }

    /// Starts looking for the service.
    ///
    /// Registers the birth listener and sends the first query.
    pub fn init(&mut self, nub: &mut Nub) -> Result<(), MercuryError> {
        if self.state != ClientState::Unresolved {
            debug!("Lookup of {} already started", self.interface_name);
            return Ok(());
        }
        info!("🔍 Looking for {}", self.interface_name);
        nub.register_birth_listener(&self.interface_name, self.listener_tag);
        self.state = ClientState::Resolving;
        self.query(nub)
    }

    fn query(&mut self, nub: &mut Nub) -> Result<(), MercuryError> {
        self.attempts += 1;
        self.timer = Some(nub.register_timer(self.config.lookup_timeout, self.timer_arg));
        nub.query_interface(&self.interface_name)
    }

    /// Points the channel at `addr`.
    ///
    /// Messages already queued for the previous address stay on the previous
    /// channel and are still delivered there.
    pub fn addr(&mut self, nub: &mut Nub, addr: Address) {
        match self.owner.as_mut() {
            Some(owner) if owner.addr() == addr && !owner.has_remote_failed() => {}
            Some(owner) => owner.reset(nub, addr),
            None => self.owner = Some(ChannelOwner::irregular(nub, addr)),
        }
        if let Some(timer) = self.timer.take() {
            nub.cancel_timer(timer);
        }
        self.state = ClientState::Bound;
    }

    /// Handles a birth announcement delivered to `tag`.
    pub fn handle_birth(
        &mut self,
        nub: &mut Nub,
        tag: ListenerTag,
        announcement: &Announcement,
    ) -> LookupProgress {
        if tag != self.listener_tag || announcement.name != self.interface_name {
            return LookupProgress::Ignored;
        }
        if self.state == ClientState::Bound && self.service_addr() == Some(announcement.addr) {
            return LookupProgress::Ignored;
        }

        match self.service_addr() {
            Some(old) => info!(
                "🔀 {} moved from {} to {}",
                self.interface_name, old, announcement.addr
            ),
            None => info!("✅ Found {} at {}", self.interface_name, announcement.addr),
        }
        self.addr(nub, announcement.addr);
        LookupProgress::Bound(announcement.addr)
    }

    /// Handles expiry of timer `id`.
    pub fn handle_timeout(&mut self, nub: &mut Nub, id: TimerId) -> LookupProgress {
        if self.timer != Some(id) || self.state != ClientState::Resolving {
            return LookupProgress::Ignored;
        }
        self.timer = None;

        if self.attempts >= self.config.num_retries {
            warn!(
                "❌ Could not find {} after {} attempts",
                self.interface_name, self.attempts
            );
            self.state = ClientState::Failed;
            return LookupProgress::Failed;
        }

        debug!(
            "No answer for {}, retrying ({}/{})",
            self.interface_name, self.attempts, self.config.num_retries
        );
        match self.query(nub) {
            Ok(()) => LookupProgress::Retrying,
            Err(e) => {
                warn!("Query for {} failed: {}", self.interface_name, e);
                LookupProgress::Retrying
            }
        }
    }

    /// Sends a message to the service.
    pub fn send<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
    ) -> Result<(), MercuryError> {
        let owner = self.owner.as_ref().ok_or_else(|| {
            MercuryError::Network(format!("{} has not been located", self.interface_name))
        })?;
        owner.send(nub, element, args)
    }

    /// Sends a request to the service.
    pub fn send_request<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
    ) -> Result<mercury::ReplyId, MercuryError> {
        let owner = self.owner.as_ref().ok_or_else(|| {
            MercuryError::Network(format!("{} has not been located", self.interface_name))
        })?;
        owner.send_request(nub, element, args, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury::{ChannelKind, NubConfig};
    use tokio::time::Instant;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn nub() -> Nub {
        Nub::new(
            addr("10.0.0.1:1000"),
            NubConfig {
                announce_addresses: vec![addr("10.0.0.2:1000")],
                ..Default::default()
            },
        )
    }

    fn birth(at: &str) -> Announcement {
        Announcement {
            name: "DBMgrInterface".to_string(),
            addr: addr(at),
        }
    }

    #[test]
    fn test_init_queries_and_binds_on_birth() {
        let mut nub = nub();
        let mut client = AnonymousChannelClient::new("DBMgrInterface", 1, 100, LookupConfig::default());

        client.init(&mut nub).unwrap();
        assert_eq!(client.state(), ClientState::Resolving);
        assert_eq!(nub.drain_outbox().len(), 1);
        assert_eq!(nub.num_timers(), 1);

        // Wrong tag is ignored
        assert_eq!(
            client.handle_birth(&mut nub, 2, &birth("10.0.0.2:2000")),
            LookupProgress::Ignored
        );

        let progress = client.handle_birth(&mut nub, 1, &birth("10.0.0.2:2000"));
        assert_eq!(progress, LookupProgress::Bound(addr("10.0.0.2:2000")));
        assert_eq!(client.state(), ClientState::Bound);
        assert_eq!(nub.num_timers(), 0);
        assert_eq!(client.channel().unwrap().channel().kind(), ChannelKind::Irregular);
    }

    #[test]
    fn test_retries_then_fails() {
        let mut nub = nub();
        let config = LookupConfig {
            num_retries: 2,
            lookup_timeout: Duration::from_millis(10),
        };
        let mut client = AnonymousChannelClient::new("DBMgrInterface", 1, 100, config);
        client.init(&mut nub).unwrap();

        let first = client.timer.unwrap();
        assert_eq!(client.handle_timeout(&mut nub, first), LookupProgress::Retrying);
        // The old timer id is stale now
        assert_eq!(client.handle_timeout(&mut nub, first), LookupProgress::Ignored);

        let second = client.timer.unwrap();
        assert_eq!(client.handle_timeout(&mut nub, second), LookupProgress::Failed);
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(nub.drain_outbox().len(), 2);
        assert!(client.send(&mut nub, &mercury::machine::BIRTH, &0u8).is_err());
    }

    #[test]
    fn test_rebirth_repoints_without_losing_queued_messages() {
        const WRITE: InterfaceElement = InterfaceElement::new(3, 0, "writeEntity");
        let mut nub = nub();
        let mut client = AnonymousChannelClient::new("DBMgrInterface", 1, 100, LookupConfig::default());
        client.init(&mut nub).unwrap();
        client.handle_birth(&mut nub, 1, &birth("10.0.0.2:2000"));
        nub.drain_outbox();

        client.send(&mut nub, &WRITE, &1u32).unwrap();
        let progress = client.handle_birth(&mut nub, 1, &birth("10.0.0.3:2000"));
        assert_eq!(progress, LookupProgress::Bound(addr("10.0.0.3:2000")));
        client.send(&mut nub, &WRITE, &2u32).unwrap();

        let sent: Vec<Address> = nub.drain_outbox().into_iter().map(|(to, _)| to).collect();
        assert_eq!(sent, vec![addr("10.0.0.2:2000"), addr("10.0.0.3:2000")]);

        // The old stream is still resent to A until acknowledged
        nub.process_timers(&mut Quiet, Instant::now() + Duration::from_secs(5));
        let resent: Vec<Address> = nub.drain_outbox().into_iter().map(|(to, _)| to).collect();
        assert!(resent.contains(&addr("10.0.0.2:2000")));
    }

    struct Quiet;
    impl mercury::NubHandler for Quiet {}
}
