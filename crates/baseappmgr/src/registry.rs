//! # BaseApp Registry
//!
//! Address-keyed collection of live BaseApps and backup BaseApps. Every
//! address appears at most once; ids are allocated monotonically and never
//! reused. The registry answers placement queries, keeps backup assignments
//! balanced and computes the aggregate load figures.
//!
//! The registry only changes state; telling processes about those changes is
//! the manager's job.

use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use mercury::{Address, ChannelOwner, Nub};

use crate::base_app::{BackupBaseApp, BaseApp};
use crate::error::ManagerError;
use crate::interface::BaseAppId;
use crate::snapshot::{BackupRecord, BaseAppRecord};

#[derive(Debug)]
pub struct BaseAppRegistry {
    base_apps: BTreeMap<Address, Box<BaseApp>>,
    backups: BTreeMap<Address, Box<BackupBaseApp>>,
    last_id: BaseAppId,
    overload_level: f32,
    only_backup_on_same_machine: bool,
}

impl BaseAppRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `overload_level` - Load above which a BaseApp receives no new entities
    /// * `only_backup_on_same_machine` - Restrict backups to the BaseApp's host
    pub fn new(overload_level: f32, only_backup_on_same_machine: bool) -> Self {
        Self {
            base_apps: BTreeMap::new(),
            backups: BTreeMap::new(),
            last_id: 0,
            overload_level,
            only_backup_on_same_machine,
        }
    }

    fn next_id(&mut self) -> BaseAppId {
        self.last_id += 1;
        self.last_id
    }

    pub fn last_id(&self) -> BaseAppId {
        self.last_id
    }

    pub fn overload_level(&self) -> f32 {
        self.overload_level
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Registers a BaseApp.
    ///
    /// Returns its id and whether it was newly added. Adding an address that
    /// is already registered changes nothing and returns the existing id.
    pub fn add_base_app(
        &mut self,
        nub: &mut Nub,
        addr: Address,
        external_addr: Address,
        now: Instant,
    ) -> (BaseAppId, bool) {
        if let Some(existing) = self.base_apps.get(&addr) {
            debug!("BaseApp {} already registered as {}", addr, existing.id());
            return (existing.id(), false);
        }
        let id = self.next_id();
        let channel = ChannelOwner::new(nub, addr);
        self.base_apps
            .insert(addr, Box::new(BaseApp::new(channel, external_addr, id, now)));
        info!("➕ BaseApp {} added at {} (external {})", id, addr, external_addr);
        (id, true)
    }

    /// Re-registers a BaseApp that already has an id, after a manager restart.
    ///
    /// Fails if the address is already registered or another BaseApp or
    /// backup holds the id.
    pub fn recover_base_app(
        &mut self,
        nub: &mut Nub,
        addr: Address,
        external_addr: Address,
        id: BaseAppId,
        backup: Option<Address>,
        now: Instant,
    ) -> Result<(), ManagerError> {
        if self.base_apps.contains_key(&addr) {
            return Err(ManagerError::AlreadyRegistered(addr));
        }
        if self.id_in_use(id) {
            return Err(ManagerError::DuplicateId { id, addr });
        }
        self.last_id = self.last_id.max(id);
        let channel = ChannelOwner::new(nub, addr);
        let mut base_app = Box::new(BaseApp::new(channel, external_addr, id, now));
        if let Some(backup_addr) = backup {
            if let Some(backup) = self.backups.get_mut(&backup_addr) {
                backup.add_base_app(addr);
                base_app.set_backup(Some(backup_addr));
            }
        }
        self.base_apps.insert(addr, base_app);
        info!("♻️ BaseApp {} recovered at {}", id, addr);
        Ok(())
    }

    fn id_in_use(&self, id: BaseAppId) -> bool {
        self.base_apps.values().any(|b| b.id() == id) || self.backups.values().any(|b| b.id() == id)
    }

    /// Registers a backup BaseApp; same idempotence as [`Self::add_base_app`].
    pub fn add_backup(&mut self, nub: &mut Nub, addr: Address) -> (BaseAppId, bool) {
        if let Some(existing) = self.backups.get(&addr) {
            return (existing.id(), false);
        }
        let id = self.next_id();
        let channel = ChannelOwner::new(nub, addr);
        self.backups
            .insert(addr, Box::new(BackupBaseApp::new(channel, id)));
        info!("➕ Backup BaseApp {} added at {}", id, addr);
        (id, true)
    }

    /// Removes a BaseApp and unlinks it from its backup.
    pub fn remove_base_app(&mut self, addr: Address) -> Option<Box<BaseApp>> {
        let base_app = self.base_apps.remove(&addr)?;
        if let Some(backup_addr) = base_app.backup() {
            if let Some(backup) = self.backups.get_mut(&backup_addr) {
                backup.remove_base_app(addr);
            }
        }
        info!("➖ BaseApp {} at {} removed", base_app.id(), addr);
        Some(base_app)
    }

    /// Removes a backup; the BaseApps it was backing up lose their backup.
    pub fn remove_backup(&mut self, addr: Address) -> Option<Box<BackupBaseApp>> {
        let backup = self.backups.remove(&addr)?;
        for base_addr in backup.backing_up() {
            if let Some(base_app) = self.base_apps.get_mut(base_addr) {
                base_app.set_backup(None);
            }
        }
        info!("➖ Backup BaseApp {} at {} removed", backup.id(), addr);
        Some(backup)
    }

    pub fn get(&self, addr: Address) -> Option<&BaseApp> {
        self.base_apps.get(&addr).map(|b| &**b)
    }

    pub fn get_mut(&mut self, addr: Address) -> Option<&mut BaseApp> {
        self.base_apps.get_mut(&addr).map(|b| &mut **b)
    }

    pub fn get_backup(&self, addr: Address) -> Option<&BackupBaseApp> {
        self.backups.get(&addr).map(|b| &**b)
    }

    pub fn find_by_id(&self, id: BaseAppId) -> Option<&BaseApp> {
        self.base_apps
            .values()
            .find(|b| b.id() == id)
            .map(|b| &**b)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.base_apps.contains_key(&addr)
    }

    pub fn is_backup(&self, addr: Address) -> bool {
        self.backups.contains_key(&addr)
    }

    /// BaseApps in address order.
    pub fn iter(&self) -> impl Iterator<Item = &BaseApp> {
        self.base_apps.values().map(|b| &**b)
    }

    pub fn backups(&self) -> impl Iterator<Item = &BackupBaseApp> {
        self.backups.values().map(|b| &**b)
    }

    pub fn base_app_addrs(&self) -> Vec<Address> {
        self.base_apps.keys().copied().collect()
    }

    pub fn set_all_retiring(&mut self, retiring: bool) {
        for base_app in self.base_apps.values_mut() {
            base_app.set_retiring(retiring);
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Records a load report from `addr`.
    pub fn inform_of_load(
        &mut self,
        addr: Address,
        load: f32,
        num_bases: u32,
        num_proxies: u32,
        now: Instant,
    ) -> Result<(), ManagerError> {
        if !load.is_finite() || load < 0.0 {
            return Err(ManagerError::InvalidLoad { addr, load });
        }
        let base_app = self
            .base_apps
            .get_mut(&addr)
            .ok_or(ManagerError::UnknownBaseApp(addr))?;
        base_app.update_load(load, num_bases, num_proxies, now);
        Ok(())
    }

    /// The least loaded BaseApp that can take new entities.
    ///
    /// Failed, retiring and overloaded BaseApps are never chosen. Equal loads
    /// go to the lowest id.
    pub fn find_best_base_app(&self) -> Option<&BaseApp> {
        self.base_apps
            .values()
            .filter(|b| b.is_available(self.overload_level))
            .min_by(|a, b| a.load().total_cmp(&b.load()).then(a.id().cmp(&b.id())))
            .map(|b| &**b)
    }

    /// Like [`Self::find_best_base_app`] but reports why nothing was found.
    pub fn best_base_app(&self) -> Result<&BaseApp, ManagerError> {
        self.find_best_base_app()
            .ok_or(ManagerError::CapacityExhausted)
    }

    pub fn num_base_apps(&self) -> usize {
        self.base_apps.len()
    }

    pub fn num_backups(&self) -> usize {
        self.backups.len()
    }

    pub fn num_bases(&self) -> u32 {
        self.base_apps.values().map(|b| b.num_bases()).sum()
    }

    pub fn num_proxies(&self) -> u32 {
        self.base_apps.values().map(|b| b.num_proxies()).sum()
    }

    pub fn min_load(&self) -> f32 {
        self.base_apps
            .values()
            .map(|b| b.load())
            .reduce(f32::min)
            .unwrap_or(0.0)
    }

    pub fn max_load(&self) -> f32 {
        self.base_apps
            .values()
            .map(|b| b.load())
            .reduce(f32::max)
            .unwrap_or(0.0)
    }

    pub fn avg_load(&self) -> f32 {
        if self.base_apps.is_empty() {
            return 0.0;
        }
        let total: f32 = self.base_apps.values().map(|b| b.load()).sum();
        total / self.base_apps.len() as f32
    }

    /// BaseApps that have not reported load within `timeout`.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<Address> {
        self.base_apps
            .values()
            .filter(|b| now.saturating_duration_since(b.last_inform()) > timeout)
            .map(|b| b.addr())
            .collect()
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    /// Backup that should take on the BaseApp at `addr`.
    ///
    /// Picks the live backup backing up the fewest BaseApps, lowest id first.
    pub fn find_best_backup(&self, addr: Address) -> Option<Address> {
        self.backups
            .values()
            .filter(|backup| !backup.has_failed())
            .filter(|backup| !self.only_backup_on_same_machine || backup.addr().same_host(&addr))
            .min_by_key(|backup| (backup.backing_up().len(), backup.id()))
            .map(|backup| backup.addr())
    }

    /// Gives every live BaseApp without a backup the best available one.
    ///
    /// Returns the new `(base app, backup)` pairs.
    pub fn assign_backups(&mut self) -> Vec<(Address, Address)> {
        let unbacked: Vec<Address> = self
            .base_apps
            .values()
            .filter(|b| b.backup().is_none() && !b.has_failed())
            .map(|b| b.addr())
            .collect();

        let mut assigned = Vec::new();
        for addr in unbacked {
            let Some(backup_addr) = self.find_best_backup(addr) else {
                continue;
            };
            if let Some(backup) = self.backups.get_mut(&backup_addr) {
                backup.add_base_app(addr);
            }
            if let Some(base_app) = self.base_apps.get_mut(&addr) {
                base_app.set_backup(Some(backup_addr));
            }
            debug!("BaseApp {} backed up by {}", addr, backup_addr);
            assigned.push((addr, backup_addr));
        }
        assigned
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn records(&self) -> (Vec<BaseAppRecord>, Vec<BackupRecord>) {
        let base_apps = self
            .base_apps
            .values()
            .map(|b| BaseAppRecord {
                addr: b.addr(),
                external_addr: b.external_addr(),
                id: b.id(),
                load: b.load(),
                num_bases: b.num_bases(),
                num_proxies: b.num_proxies(),
                backup: b.backup(),
                retiring: b.is_retiring(),
            })
            .collect();
        let backups = self
            .backups
            .values()
            .map(|b| BackupRecord {
                addr: b.addr(),
                id: b.id(),
                backing_up: b.backing_up().iter().copied().collect(),
            })
            .collect();
        (base_apps, backups)
    }

    /// Rebuilds the registry from records, opening fresh channels.
    pub fn restore(
        &mut self,
        nub: &mut Nub,
        last_id: BaseAppId,
        base_apps: &[BaseAppRecord],
        backups: &[BackupRecord],
        now: Instant,
    ) {
        self.base_apps.clear();
        self.backups.clear();
        self.last_id = last_id;

        for record in backups {
            let channel = ChannelOwner::new(nub, record.addr);
            let mut backup = Box::new(BackupBaseApp::new(channel, record.id));
            for addr in &record.backing_up {
                backup.add_base_app(*addr);
            }
            self.last_id = self.last_id.max(record.id);
            self.backups.insert(record.addr, backup);
        }

        for record in base_apps {
            let channel = ChannelOwner::new(nub, record.addr);
            let mut base_app = Box::new(BaseApp::new(channel, record.external_addr, record.id, now));
            base_app.update_load(record.load, record.num_bases, record.num_proxies, now);
            base_app.set_backup(record.backup);
            base_app.set_retiring(record.retiring);
            self.last_id = self.last_id.max(record.id);
            self.base_apps.insert(record.addr, base_app);
        }
        info!(
            "♻️ Registry restored with {} BaseApps and {} backups",
            self.base_apps.len(),
            self.backups.len()
        );
    }
}
