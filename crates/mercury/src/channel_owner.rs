//! Holder of a channel that is kept alive for a component's lifetime.

use serde::Serialize;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use tokio::time::Duration;
use tracing::info;

use crate::address::Address;
use crate::channel::{Channel, ChannelKind};
use crate::error::MercuryError;
use crate::interface::InterfaceElement;
use crate::nub::Nub;
use crate::wire::ReplyId;

/// Owns a channel to one address and can be re-pointed at another.
///
/// While an owner exists the Nub never evicts its channel. Dropping the owner
/// lets the Nub reclaim the channel once its queued messages are acknowledged.
#[derive(Debug)]
pub struct ChannelOwner {
    channel: Rc<RefCell<Channel>>,
}

impl ChannelOwner {
    /// Takes ownership of the Nub's channel to `addr`.
    pub fn new(nub: &mut Nub, addr: Address) -> Self {
        Self {
            channel: nub.acquire_channel(addr),
        }
    }

    /// Like [`ChannelOwner::new`] but with the slower irregular resend cadence.
    pub fn irregular(nub: &mut Nub, addr: Address) -> Self {
        let owner = Self::new(nub, addr);
        owner.channel.borrow_mut().set_kind(ChannelKind::Irregular);
        owner
    }

    pub fn addr(&self) -> Address {
        self.channel.borrow().addr()
    }

    pub fn has_remote_failed(&self) -> bool {
        self.channel.borrow().has_remote_failed()
    }

    /// Read access to the underlying channel.
    pub fn channel(&self) -> Ref<'_, Channel> {
        self.channel.borrow()
    }

    /// Sends a one-way message over the owned channel.
    pub fn send<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
    ) -> Result<(), MercuryError> {
        nub.send_on(&self.channel, element, args)
    }

    /// Sends a request over the owned channel using the Nub's reply timeout.
    pub fn send_request<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
    ) -> Result<ReplyId, MercuryError> {
        let timeout = nub.config().reply_timeout;
        nub.request_on(&self.channel, element, args, tag, timeout)
    }

    pub fn send_request_with_timeout<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
        timeout: Duration,
    ) -> Result<ReplyId, MercuryError> {
        nub.request_on(&self.channel, element, args, tag, timeout)
    }

    /// Re-points the owner at `addr`, rebuilding the channel.
    ///
    /// With the current address the channel is reset in place. With a new
    /// address the owner switches channels; messages already queued on the
    /// old channel keep going to the old address until acknowledged.
    pub fn reset(&mut self, nub: &mut Nub, addr: Address) {
        let kind = self.channel.borrow().kind();
        let old = self.addr();
        if old == addr {
            nub.reset_channel(&self.channel);
        } else {
            info!("🔀 Channel owner moving from {} to {}", old, addr);
            self.channel = nub.acquire_channel(addr);
            if self.channel.borrow().has_remote_failed() {
                nub.reset_channel(&self.channel);
            }
        }
        self.channel.borrow_mut().set_kind(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::nub::NubConfig;

    const NOTE: InterfaceElement = InterfaceElement::new(5, 1, "note");

    fn addr(port: u16) -> Address {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_reset_same_address_revives_failed_channel() {
        let mut nub = Nub::new(addr(1), NubConfig::default());
        let mut owner = ChannelOwner::new(&mut nub, addr(2));
        let version = owner.channel().version();

        nub.fail_channel(addr(2), FailureReason::NoAck);
        assert!(owner.has_remote_failed());

        owner.reset(&mut nub, addr(2));
        assert!(!owner.has_remote_failed());
        assert_ne!(owner.channel().version(), version);
        owner.send(&mut nub, &NOTE, &1u32).unwrap();
        assert_eq!(nub.drain_outbox().len(), 1);
    }

    #[test]
    fn test_reset_new_address_leaves_old_channel_draining() {
        let mut nub = Nub::new(addr(1), NubConfig::default());
        let mut owner = ChannelOwner::irregular(&mut nub, addr(2));
        owner.send(&mut nub, &NOTE, &1u32).unwrap();

        owner.reset(&mut nub, addr(3));
        owner.send(&mut nub, &NOTE, &2u32).unwrap();

        let sent: Vec<Address> = nub.drain_outbox().into_iter().map(|(to, _)| to).collect();
        assert_eq!(sent, vec![addr(2), addr(3)]);
        assert_eq!(owner.addr(), addr(3));
        assert_eq!(owner.channel().kind(), ChannelKind::Irregular);

        // The old channel still holds its unacked message
        assert_eq!(nub.channel(addr(2)).unwrap().num_unacked(), 1);
    }
}
