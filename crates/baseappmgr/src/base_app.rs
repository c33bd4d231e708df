//! Manager-side records of BaseApps and backup BaseApps.

use std::collections::BTreeSet;
use tokio::time::Instant;

use mercury::{Address, ChannelOwner};

use crate::interface::BaseAppId;

/// A BaseApp as seen by the manager.
#[derive(Debug)]
pub struct BaseApp {
    addr: Address,
    external_addr: Address,
    id: BaseAppId,
    channel: ChannelOwner,
    load: f32,
    num_bases: u32,
    num_proxies: u32,
    last_inform: Instant,
    backup: Option<Address>,
    retiring: bool,
}

impl BaseApp {
    pub fn new(
        channel: ChannelOwner,
        external_addr: Address,
        id: BaseAppId,
        now: Instant,
    ) -> Self {
        Self {
            addr: channel.addr(),
            external_addr,
            id,
            channel,
            load: 0.0,
            num_bases: 0,
            num_proxies: 0,
            last_inform: now,
            backup: None,
            retiring: false,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn external_addr(&self) -> Address {
        self.external_addr
    }

    pub fn id(&self) -> BaseAppId {
        self.id
    }

    pub fn channel(&self) -> &ChannelOwner {
        &self.channel
    }

    pub fn load(&self) -> f32 {
        self.load
    }

    pub fn num_bases(&self) -> u32 {
        self.num_bases
    }

    pub fn num_proxies(&self) -> u32 {
        self.num_proxies
    }

    pub fn last_inform(&self) -> Instant {
        self.last_inform
    }

    pub fn backup(&self) -> Option<Address> {
        self.backup
    }

    pub fn set_backup(&mut self, backup: Option<Address>) {
        self.backup = backup;
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub fn set_retiring(&mut self, retiring: bool) {
        self.retiring = retiring;
    }

    /// Whether the channel to this BaseApp has failed.
    pub fn has_failed(&self) -> bool {
        self.channel.has_remote_failed()
    }

    /// Records a load report.
    pub fn update_load(&mut self, load: f32, num_bases: u32, num_proxies: u32, now: Instant) {
        self.load = load;
        self.num_bases = num_bases;
        self.num_proxies = num_proxies;
        self.last_inform = now;
    }

    /// Whether the BaseApp can take new entities.
    pub fn is_available(&self, overload_level: f32) -> bool {
        !self.has_failed() && !self.retiring && self.load <= overload_level
    }
}

/// A backup BaseApp and the BaseApps it backs up.
#[derive(Debug)]
pub struct BackupBaseApp {
    addr: Address,
    id: BaseAppId,
    channel: ChannelOwner,
    backing_up: BTreeSet<Address>,
}

impl BackupBaseApp {
    pub fn new(channel: ChannelOwner, id: BaseAppId) -> Self {
        Self {
            addr: channel.addr(),
            id,
            channel,
            backing_up: BTreeSet::new(),
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn id(&self) -> BaseAppId {
        self.id
    }

    pub fn channel(&self) -> &ChannelOwner {
        &self.channel
    }

    pub fn has_failed(&self) -> bool {
        self.channel.has_remote_failed()
    }

    pub fn backing_up(&self) -> &BTreeSet<Address> {
        &self.backing_up
    }

    pub fn add_base_app(&mut self, addr: Address) -> bool {
        self.backing_up.insert(addr)
    }

    pub fn remove_base_app(&mut self, addr: Address) -> bool {
        self.backing_up.remove(&addr)
    }
}
