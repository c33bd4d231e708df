//! # BaseApp Manager
//!
//! The manager process keeps track of every BaseApp, places new entities on
//! the least loaded one, reacts to BaseApp death and drives controlled
//! shutdowns.
//!
//! All state lives in [`BaseAppMgr`], which is handed to the Nub's dispatch
//! loop together with the table returned by [`BaseAppMgr::interface_table`].
//! Nothing here blocks: waiting on other processes is expressed with timers
//! and reply tags.

use serde::Serialize;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use mercury::{
    Address, Announcement, FailureReason, Incoming, InterfaceElement, InterfaceTable, ListenerTag,
    MercuryError, Nub, NubHandler, ReplyId, TimerId,
};
use server_common::{AnonymousChannelClient, LookupProgress};

use crate::config::BaseAppMgrConfig;
use crate::error::ManagerError;
use crate::global_bases::GlobalBases;
use crate::interface::{
    base_app, db_mgr, manager, AddArgs, AddReply, BackupAddReply, BackupTarget,
    BaseAppDeathArgs, CreateBaseArgs, CreateBaseInfo, CreateBaseResult, DelArgs, EntityMailBox,
    GlobalBaseArgs, GlobalBaseName, HandleBaseAppDeathArgs, HealthSummary, InformOfLoadArgs,
    RecoverBaseAppArgs, RestoreEntitiesArgs, SetBackupArgs, SharedDataEntry, SharedDataKey,
    ShutDownArgs, ShutDownStageArgs, BASE_APP_MGR_NAME, BASE_APP_NAME, DB_MGR_NAME,
};
use crate::registry::BaseAppRegistry;
use crate::shared_data::{SharedData, SharedDataType};
use crate::shutdown::{ShutDownStage, ShutdownCoordinator};
use crate::snapshot::RegistrySnapshot;

/// Timer arg of the game tick.
pub const TICK_TIMER: u64 = 1;
/// Timer arg of the shutdown stage deadline.
pub const SHUT_DOWN_TIMER: u64 = 2;
/// Timer arg of the DBMgr lookup.
pub const DB_MGR_LOOKUP_TIMER: u64 = 3;

const DB_MGR_LISTENER: ListenerTag = 1;
const BASE_APP_DEATH_LISTENER: ListenerTag = 2;

/// Reply tags of forwarded entity creations start here.
const CREATE_TAG_BASE: u64 = 1 << 32;

#[derive(Debug, Clone, Copy)]
struct PendingCreate {
    requester: Address,
    reply_id: ReplyId,
    base_app: Address,
}

/// State of the BaseApp manager process.
#[derive(Debug)]
pub struct BaseAppMgr {
    config: BaseAppMgrConfig,
    registry: BaseAppRegistry,
    shared_data: SharedData,
    global_bases: GlobalBases,
    shutdown: ShutdownCoordinator,
    db_mgr: Option<AnonymousChannelClient>,
    game_time: u64,
    tick_timer: Option<TimerId>,
    best_base_app: Option<Address>,
    pending_creates: HashMap<u64, PendingCreate>,
    next_create_tag: u64,
    allow_new_base_apps: bool,
}

fn expect_reply_id(msg: &Incoming) -> Result<ReplyId, MercuryError> {
    msg.reply_id.ok_or_else(|| {
        MercuryError::Protocol(format!(
            "Request {}.{} from {} carries no reply id",
            msg.interface, msg.method, msg.source
        ))
    })
}

impl BaseAppMgr {
    pub fn new(config: BaseAppMgrConfig) -> Self {
        let registry = BaseAppRegistry::new(
            config.base_app_overload_level,
            config.only_use_backup_on_same_machine,
        );
        let db_mgr = config.db_mgr_lookup.clone().map(|lookup| {
            AnonymousChannelClient::new(DB_MGR_NAME, DB_MGR_LISTENER, DB_MGR_LOOKUP_TIMER, lookup)
        });
        let allow_new_base_apps = config.allow_new_base_apps;

        Self {
            config,
            registry,
            shared_data: SharedData::new(),
            global_bases: GlobalBases::new(),
            shutdown: ShutdownCoordinator::new(),
            db_mgr,
            game_time: 0,
            tick_timer: None,
            best_base_app: None,
            pending_creates: HashMap::new(),
            next_create_tag: CREATE_TAG_BASE,
            allow_new_base_apps,
        }
    }

    /// Message handlers of the manager interface.
    pub fn interface_table() -> InterfaceTable<BaseAppMgr> {
        let mut table = InterfaceTable::new(BASE_APP_MGR_NAME);
        table
            .register(manager::ADD, on_add)
            .register(manager::ADD_BACKUP, on_add_backup)
            .register(manager::DEL, on_del)
            .register(manager::INFORM_OF_LOAD, on_inform_of_load)
            .register(manager::SHUT_DOWN, on_shut_down)
            .register(manager::CONTROLLED_SHUT_DOWN, on_controlled_shut_down)
            .register(manager::CHECK_STATUS, on_check_status)
            .register(manager::CREATE_BASE_ENTITY, on_create_base_entity)
            .register(manager::SET_SHARED_DATA, on_set_shared_data)
            .register(manager::DEL_SHARED_DATA, on_del_shared_data)
            .register(manager::REGISTER_BASE_GLOBALLY, on_register_base_globally)
            .register(manager::DEREGISTER_BASE_GLOBALLY, on_deregister_base_globally)
            .register(manager::RECOVER_BASE_APP, on_recover_base_app)
            .register(manager::HANDLE_BASE_APP_DEATH, on_handle_base_app_death)
            .register(manager::SHUT_DOWN_STAGE_ACK, on_shut_down_stage_ack);
        table
    }

    /// Announces the manager, starts the game tick and looks for the DBMgr.
    pub fn init(&mut self, nub: &mut Nub) -> Result<(), ManagerError> {
        info!(
            "🚀 BaseAppMgr starting at {} ({} Hz, overload level {})",
            nub.local_addr(),
            self.config.update_hertz,
            self.config.base_app_overload_level
        );
        nub.register_death_listener(BASE_APP_NAME, BASE_APP_DEATH_LISTENER);
        nub.announce_birth(BASE_APP_MGR_NAME)?;

        if let Some(db_mgr) = self.db_mgr.as_mut() {
            db_mgr.init(nub)?;
        }

        self.tick_timer = Some(nub.register_timer(self.config.tick_interval(), TICK_TIMER));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &BaseAppMgrConfig {
        &self.config
    }

    pub fn registry(&self) -> &BaseAppRegistry {
        &self.registry
    }

    pub fn shared_data(&self) -> &SharedData {
        &self.shared_data
    }

    pub fn global_bases(&self) -> &GlobalBases {
        &self.global_bases
    }

    pub fn game_time(&self) -> u64 {
        self.game_time
    }

    /// Game time in seconds.
    pub fn game_time_in_seconds(&self) -> f64 {
        self.game_time as f64 / f64::from(self.config.update_hertz.max(1))
    }

    pub fn shut_down_stage(&self) -> ShutDownStage {
        self.shutdown.stage()
    }

    pub fn best_base_app_addr(&self) -> Option<Address> {
        self.best_base_app
    }

    pub fn db_mgr_addr(&self) -> Option<Address> {
        self.db_mgr.as_ref().and_then(|db| db.service_addr())
    }

    pub fn is_accepting_base_apps(&self) -> bool {
        self.allow_new_base_apps && !self.shutdown.is_shutting_down()
    }

    pub fn set_allow_new_base_apps(&mut self, allow: bool) {
        self.allow_new_base_apps = allow;
    }

    pub fn health_summary(&self) -> HealthSummary {
        HealthSummary {
            num_base_apps: self.registry.num_base_apps(),
            num_backups: self.registry.num_backups(),
            num_bases: self.registry.num_bases(),
            num_proxies: self.registry.num_proxies(),
            min_load: self.registry.min_load(),
            avg_load: self.registry.avg_load(),
            max_load: self.registry.max_load(),
            game_time: self.game_time,
            accepting_new_base_apps: self.is_accepting_base_apps(),
            shut_down_stage: self.shutdown.stage(),
            db_mgr: self.db_mgr_addr(),
            num_global_bases: self.global_bases.len(),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn send_to<T: Serialize>(
        &self,
        nub: &mut Nub,
        addr: Address,
        element: &InterfaceElement,
        args: &T,
    ) {
        let result = match (self.registry.get(addr), self.registry.get_backup(addr)) {
            (Some(base_app), _) => base_app.channel().send(nub, element, args),
            (None, Some(backup)) => backup.channel().send(nub, element, args),
            (None, None) => nub.send(addr, element, args),
        };
        if let Err(e) = result {
            warn!("Could not send {} to {}: {}", element, addr, e);
        }
    }

    /// Sends a message to every BaseApp except `exclude`.
    fn send_to_base_apps<T: Serialize>(
        &self,
        nub: &mut Nub,
        element: &InterfaceElement,
        args: &T,
        exclude: Option<Address>,
    ) {
        for addr in self.registry.base_app_addrs() {
            if Some(addr) != exclude {
                self.send_to(nub, addr, element, args);
            }
        }
    }

    fn notify_backup_assignments(&self, nub: &mut Nub, assigned: &[(Address, Address)]) {
        for &(base_addr, backup_addr) in assigned {
            self.send_to(
                nub,
                base_addr,
                &base_app::SET_BACKUP,
                &SetBackupArgs {
                    backup: Some(backup_addr),
                },
            );
            self.send_to(
                nub,
                backup_addr,
                &base_app::START_BACKUP,
                &BackupTarget {
                    base_app: base_addr,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Registers a BaseApp and returns the reply it should receive.
    ///
    /// Returns `NotAccepting` while shutting down or when new BaseApps are
    /// disallowed.
    pub fn add(
        &mut self,
        nub: &mut Nub,
        addr: Address,
        external_addr: Address,
    ) -> Result<AddReply, ManagerError> {
        if !self.is_accepting_base_apps() {
            return Err(ManagerError::NotAccepting);
        }
        let (id, added) = self
            .registry
            .add_base_app(nub, addr, external_addr, Instant::now());
        if added {
            let assigned = self.registry.assign_backups();
            self.notify_backup_assignments(nub, &assigned);
            if self.best_base_app.is_none() {
                self.best_base_app = self.registry.find_best_base_app().map(|b| b.addr());
            }
        }
        Ok(AddReply {
            id,
            game_time: self.game_time,
            create_base_addr: self.best_base_app.unwrap_or(addr),
            shared_base_app_data: self.shared_data.entries(SharedDataType::BaseApp),
            shared_global_data: self.shared_data.entries(SharedDataType::Global),
        })
    }

    /// Registers a backup BaseApp and hands it BaseApps to back up.
    pub fn add_backup(&mut self, nub: &mut Nub, addr: Address) -> Result<BackupAddReply, ManagerError> {
        if !self.is_accepting_base_apps() {
            return Err(ManagerError::NotAccepting);
        }
        let (id, added) = self.registry.add_backup(nub, addr);
        if added {
            let assigned = self.registry.assign_backups();
            self.notify_backup_assignments(nub, &assigned);
        }
        Ok(BackupAddReply { id })
    }

    /// Removes a BaseApp that died or left.
    ///
    /// With `should_restore` its entities are restored on its backup, or on
    /// the best remaining BaseApp when it has none. The other BaseApps are
    /// told where the entities went. Returns `false` if the address was not
    /// registered.
    pub fn on_base_app_gone(&mut self, nub: &mut Nub, addr: Address, should_restore: bool) -> bool {
        let Some(gone) = self.registry.remove_base_app(addr) else {
            return false;
        };

        for name in self.global_bases.remove_hosted_by(addr) {
            debug!("Global base '{}' went away with {}", name, addr);
            self.send_to_base_apps(nub, &base_app::DEL_GLOBAL_BASE, &GlobalBaseName { name }, None);
        }

        let creates_lost: Vec<u64> = self
            .pending_creates
            .iter()
            .filter(|(_, pending)| pending.base_app == addr)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in creates_lost {
            if let Some(pending) = self.pending_creates.remove(&tag) {
                self.answer_create(nub, pending, CreateBaseResult::Failed(format!("BaseApp {addr} died")));
            }
        }

        if self.shutdown.forget(addr) {
            self.advance_shut_down(nub);
        }

        if should_restore && self.config.shut_down_server_on_base_app_death {
            error!("💀 BaseApp {} died, shutting the server down", addr);
            self.start_controlled_shut_down(nub);
            return true;
        }

        let restored_at = if should_restore {
            let target = gone
                .backup()
                .filter(|backup| self.registry.get_backup(*backup).map_or(false, |b| !b.has_failed()))
                .or_else(|| self.registry.find_best_base_app().map(|b| b.addr()));
            match target {
                Some(target) => {
                    info!("🚑 Restoring entities of {} on {}", addr, target);
                    self.send_to(nub, target, &base_app::RESTORE_ENTITIES, &RestoreEntitiesArgs { dead: addr });
                }
                None => error!("❌ Nowhere to restore the entities of {}", addr),
            }
            target
        } else {
            if let Some(backup) = gone.backup() {
                self.send_to(nub, backup, &base_app::STOP_BACKUP, &BackupTarget { base_app: addr });
            }
            None
        };

        self.send_to_base_apps(
            nub,
            &base_app::HANDLE_BASE_APP_DEATH,
            &BaseAppDeathArgs {
                dead: addr,
                restored_at,
            },
            None,
        );

        if self.best_base_app == Some(addr) {
            self.best_base_app = None;
            self.update_create_base_info(nub);
        }
        true
    }

    /// Removes a backup BaseApp and re-assigns what it was backing up.
    pub fn on_backup_gone(&mut self, nub: &mut Nub, addr: Address) -> bool {
        let Some(gone) = self.registry.remove_backup(addr) else {
            return false;
        };
        warn!("Backup BaseApp {} gone, re-assigning {} BaseApps", addr, gone.backing_up().len());

        let assigned = self.registry.assign_backups();
        for orphan in gone.backing_up() {
            if !assigned.iter().any(|(base, _)| base == orphan) {
                self.send_to(nub, *orphan, &base_app::SET_BACKUP, &SetBackupArgs { backup: None });
            }
        }
        self.notify_backup_assignments(nub, &assigned);
        true
    }

    // ------------------------------------------------------------------
    // Entity placement
    // ------------------------------------------------------------------

    /// Forwards an entity creation to the best BaseApp.
    ///
    /// The requester receives the new mailbox once the BaseApp replies.
    pub fn create_base_entity(
        &mut self,
        nub: &mut Nub,
        requester: Address,
        reply_id: ReplyId,
        args: &CreateBaseArgs,
    ) -> Result<(), ManagerError> {
        let target = self.registry.best_base_app()?.addr();
        let tag = self.next_create_tag;
        self.next_create_tag += 1;

        let channel = self
            .registry
            .get(target)
            .ok_or(ManagerError::UnknownBaseApp(target))?
            .channel();
        channel.send_request(nub, &base_app::CREATE_BASE, args, tag)?;
        self.pending_creates.insert(
            tag,
            PendingCreate {
                requester,
                reply_id,
                base_app: target,
            },
        );
        debug!("Creating entity type {} on {}", args.entity_type, target);
        Ok(())
    }

    fn answer_create(&self, nub: &mut Nub, pending: PendingCreate, result: CreateBaseResult) {
        if let Err(e) = nub.reply(pending.requester, pending.reply_id, &result) {
            warn!("Could not answer entity creation for {}: {}", pending.requester, e);
        }
    }

    // ------------------------------------------------------------------
    // Game tick
    // ------------------------------------------------------------------

    /// Advances game time by one tick.
    pub fn tick(&mut self, nub: &mut Nub) {
        self.game_time += 1;
        if !self.shutdown.is_shutting_down() {
            self.check_for_dead_base_apps(nub, Instant::now());
        }
        let period = u64::from(self.config.update_create_base_info_period.max(1));
        if self.game_time % period == 0 {
            self.update_create_base_info(nub);
        }
    }

    /// Removes BaseApps that stopped reporting their load.
    pub fn check_for_dead_base_apps(&mut self, nub: &mut Nub, now: Instant) {
        for addr in self.registry.timed_out(now, self.config.base_app_timeout) {
            error!("💀 BaseApp {} has not reported for {:?}", addr, self.config.base_app_timeout);
            self.on_base_app_gone(nub, addr, true);
        }
    }

    /// Tells every BaseApp where new bases should be created.
    pub fn update_create_base_info(&mut self, nub: &mut Nub) {
        self.best_base_app = self.registry.find_best_base_app().map(|b| b.addr());
        match self.best_base_app {
            Some(best) => self.send_to_base_apps(nub, &base_app::UPDATE_CREATE_BASE_INFO, &CreateBaseInfo { best }, None),
            None if self.registry.num_base_apps() > 0 => {
                warn!("All {} BaseApps are overloaded or unavailable", self.registry.num_base_apps())
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops the manager at once, optionally taking the BaseApps with it.
    pub fn shut_down(&mut self, nub: &mut Nub, shut_down_others: bool) {
        info!("🛑 BaseAppMgr shutting down (others: {})", shut_down_others);
        if shut_down_others {
            self.send_to_base_apps(
                nub,
                &base_app::SHUT_DOWN,
                &ShutDownArgs {
                    shut_down_others: false,
                },
                None,
            );
        }
        if let Err(e) = nub.announce_death(BASE_APP_MGR_NAME) {
            warn!("Could not announce death: {}", e);
        }
        nub.break_processing();
    }

    /// Begins a controlled shutdown of every BaseApp.
    pub fn start_controlled_shut_down(&mut self, nub: &mut Nub) {
        if self.shutdown.is_shutting_down() {
            debug!("Controlled shutdown already in progress");
            return;
        }
        info!("🛑 Starting controlled shutdown of {} BaseApps", self.registry.num_base_apps());
        self.registry.set_all_retiring(true);
        self.start_async_shut_down_stage(nub, ShutDownStage::Request);
    }

    /// Broadcasts `stage` and waits for acknowledgements.
    pub fn start_async_shut_down_stage(&mut self, nub: &mut Nub, stage: ShutDownStage) {
        info!("⏳ Shutdown stage: {}", stage);
        self.shutdown.begin(stage, self.registry.base_app_addrs());
        self.send_to_base_apps(nub, &base_app::SHUT_DOWN_STAGE, &ShutDownStageArgs { stage }, None);

        if self.shutdown.is_stage_complete() {
            self.advance_shut_down(nub);
        } else {
            let timer = nub.register_timer(self.config.shut_down_stage_timeout, SHUT_DOWN_TIMER);
            self.shutdown.set_timer(timer);
        }
    }

    fn advance_shut_down(&mut self, nub: &mut Nub) {
        if let Some(timer) = self.shutdown.take_timer() {
            nub.cancel_timer(timer);
        }
        match self.shutdown.stage().next() {
            ShutDownStage::Finished => self.finish_shut_down(nub),
            next => self.start_async_shut_down_stage(nub, next),
        }
    }

    fn finish_shut_down(&mut self, nub: &mut Nub) {
        self.shutdown.begin(ShutDownStage::Finished, []);
        for (stage, addr) in self.shutdown.failed() {
            warn!("BaseApp {} failed during shutdown stage {}", addr, stage);
        }
        if let Some(db_mgr) = self.db_mgr.as_ref() {
            if let Err(e) = db_mgr.send(nub, &db_mgr::CONTROLLED_SHUT_DOWN, &ShutDownStageArgs {
                stage: ShutDownStage::Finished,
            }) {
                debug!("DBMgr not told about shutdown: {}", e);
            }
        }
        if let Some(timer) = self.tick_timer.take() {
            nub.cancel_timer(timer);
        }
        info!("🏁 Controlled shutdown complete");
        if let Err(e) = nub.announce_death(BASE_APP_MGR_NAME) {
            warn!("Could not announce death: {}", e);
        }
        nub.break_processing();
    }

    fn on_shut_down_timeout(&mut self, nub: &mut Nub) {
        let stage = self.shutdown.stage();
        for addr in self.shutdown.expire() {
            warn!("BaseApp {} did not acknowledge shutdown stage {}", addr, stage);
        }
        self.advance_shut_down(nub);
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (base_apps, backups) = self.registry.records();
        RegistrySnapshot {
            last_id: self.registry.last_id(),
            game_time: self.game_time,
            base_apps,
            backups,
            shared_data: self.shared_data.clone(),
            global_bases: self.global_bases.clone(),
        }
    }

    /// Replaces the current state with a snapshot.
    pub fn restore(&mut self, nub: &mut Nub, snapshot: RegistrySnapshot) {
        self.registry.restore(
            nub,
            snapshot.last_id,
            &snapshot.base_apps,
            &snapshot.backups,
            Instant::now(),
        );
        self.game_time = snapshot.game_time;
        self.shared_data = snapshot.shared_data;
        self.global_bases = snapshot.global_bases;
        self.best_base_app = self.registry.find_best_base_app().map(|b| b.addr());
    }
}

impl NubHandler for BaseAppMgr {
    fn handle_timeout(&mut self, nub: &mut Nub, id: TimerId, arg: u64) -> Option<Duration> {
        match arg {
            TICK_TIMER if self.tick_timer == Some(id) => {
                self.tick(nub);
                Some(self.config.tick_interval())
            }
            SHUT_DOWN_TIMER => {
                if self.shutdown.take_timer_if(id) {
                    self.on_shut_down_timeout(nub);
                }
                None
            }
            DB_MGR_LOOKUP_TIMER => {
                if let Some(db_mgr) = self.db_mgr.as_mut() {
                    if db_mgr.handle_timeout(nub, id) == LookupProgress::Failed {
                        warn!("Continuing without a DBMgr");
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn handle_reply(&mut self, nub: &mut Nub, tag: u64, reply: Result<Incoming, MercuryError>) {
        let Some(pending) = self.pending_creates.remove(&tag) else {
            debug!("Ignoring reply with unknown tag {}", tag);
            return;
        };
        let result = match reply.and_then(|msg| msg.args::<EntityMailBox>()) {
            Ok(mailbox) => CreateBaseResult::Created(mailbox),
            Err(e) => CreateBaseResult::Failed(e.to_string()),
        };
        self.answer_create(nub, pending, result);
    }

    fn handle_birth(&mut self, nub: &mut Nub, tag: ListenerTag, announcement: &Announcement) {
        if let Some(db_mgr) = self.db_mgr.as_mut() {
            db_mgr.handle_birth(nub, tag, announcement);
        }
    }

    fn handle_death(&mut self, nub: &mut Nub, tag: ListenerTag, announcement: &Announcement) {
        if tag != BASE_APP_DEATH_LISTENER {
            return;
        }
        if !self.on_base_app_gone(nub, announcement.addr, true) {
            self.on_backup_gone(nub, announcement.addr);
        }
    }

    fn handle_channel_failure(&mut self, nub: &mut Nub, addr: Address, reason: FailureReason) {
        if self.registry.contains(addr) {
            error!("💀 BaseApp {} failed: {}", addr, reason);
            self.on_base_app_gone(nub, addr, true);
        } else if self.registry.is_backup(addr) {
            error!("💀 Backup BaseApp {} failed: {}", addr, reason);
            self.on_backup_gone(nub, addr);
        }
    }

    fn handle_interrupt(&mut self, nub: &mut Nub) {
        if self.shutdown.is_shutting_down() {
            warn!("Interrupted again, stopping immediately");
            nub.break_processing();
        } else {
            self.start_controlled_shut_down(nub);
        }
    }
}

// ----------------------------------------------------------------------
// Message handlers
// ----------------------------------------------------------------------

fn on_add(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = expect_reply_id(msg)?;
    let args: AddArgs = msg.args()?;
    match mgr.add(nub, msg.source, args.external_addr) {
        Ok(reply) => nub.reply(msg.source, reply_id, &reply),
        Err(e) => {
            warn!("Refusing BaseApp {}: {}", msg.source, e);
            nub.reply_empty(msg.source, reply_id);
            Ok(())
        }
    }
}

fn on_add_backup(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = expect_reply_id(msg)?;
    match mgr.add_backup(nub, msg.source) {
        Ok(reply) => nub.reply(msg.source, reply_id, &reply),
        Err(e) => {
            warn!("Refusing backup BaseApp {}: {}", msg.source, e);
            nub.reply_empty(msg.source, reply_id);
            Ok(())
        }
    }
}

fn on_del(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: DelArgs = msg.args()?;
    match mgr.registry.get(msg.source).map(|b| b.id()) {
        Some(id) if id == args.id => {
            info!("👋 BaseApp {} at {} deregistering", id, msg.source);
            mgr.on_base_app_gone(nub, msg.source, false);
        }
        Some(id) => warn!(
            "BaseApp at {} asked to delete id {} but is {}",
            msg.source, args.id, id
        ),
        None => {
            if !mgr.on_backup_gone(nub, msg.source) {
                warn!("del from unknown process {}", msg.source);
            }
        }
    }
    Ok(())
}

fn on_inform_of_load(mgr: &mut BaseAppMgr, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: InformOfLoadArgs = msg.args()?;
    match mgr.registry.inform_of_load(
        msg.source,
        args.load,
        args.num_bases,
        args.num_proxies,
        Instant::now(),
    ) {
        Ok(()) => Ok(()),
        Err(e @ ManagerError::InvalidLoad { .. }) => Err(MercuryError::Protocol(e.to_string())),
        Err(e) => {
            warn!("Ignoring load report: {}", e);
            Ok(())
        }
    }
}

fn on_shut_down(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: ShutDownArgs = msg.args()?;
    mgr.shut_down(nub, args.shut_down_others);
    Ok(())
}

fn on_controlled_shut_down(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    info!("Controlled shutdown requested by {}", msg.source);
    mgr.start_controlled_shut_down(nub);
    Ok(())
}

fn on_check_status(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = expect_reply_id(msg)?;
    nub.reply(msg.source, reply_id, &mgr.health_summary())
}

fn on_create_base_entity(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = expect_reply_id(msg)?;
    let args: CreateBaseArgs = msg.args()?;
    if let Err(e) = mgr.create_base_entity(nub, msg.source, reply_id, &args) {
        warn!("Cannot create entity for {}: {}", msg.source, e);
        nub.reply(msg.source, reply_id, &CreateBaseResult::Failed(e.to_string()))?;
    }
    Ok(())
}

fn on_set_shared_data(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let entry: SharedDataEntry = msg.args()?;
    if mgr.shared_data.set(entry.kind, &entry.key, &entry.value) {
        mgr.send_to_base_apps(nub, &base_app::SET_SHARED_DATA, &entry, None);
    }
    Ok(())
}

fn on_del_shared_data(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let key: SharedDataKey = msg.args()?;
    if mgr.shared_data.del(key.kind, &key.key) {
        mgr.send_to_base_apps(nub, &base_app::DEL_SHARED_DATA, &key, None);
    }
    Ok(())
}

fn on_register_base_globally(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = expect_reply_id(msg)?;
    let args: GlobalBaseArgs = msg.args()?;
    let registered = match mgr.global_bases.register(&args.name, args.mailbox) {
        Ok(()) => {
            info!("🌐 Global base '{}' registered on {}", args.name, args.mailbox.addr);
            mgr.send_to_base_apps(nub, &base_app::ADD_GLOBAL_BASE, &args, Some(msg.source));
            true
        }
        Err(e) => {
            debug!("{}", e);
            false
        }
    };
    nub.reply(msg.source, reply_id, &registered)
}

fn on_deregister_base_globally(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: GlobalBaseName = msg.args()?;
    if mgr.global_bases.deregister(&args.name).is_some() {
        mgr.send_to_base_apps(nub, &base_app::DEL_GLOBAL_BASE, &args, Some(msg.source));
    } else {
        warn!("Global base '{}' was not registered", args.name);
    }
    Ok(())
}

fn on_recover_base_app(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: RecoverBaseAppArgs = msg.args()?;
    if let Err(e) = mgr.registry.recover_base_app(
        nub,
        msg.source,
        args.external_addr,
        args.id,
        args.backup,
        Instant::now(),
    ) {
        warn!("Ignoring recovery of {}: {}", msg.source, e);
        return Ok(());
    }
    for (name, mailbox) in &args.global_bases {
        if let Err(e) = mgr.global_bases.register(name, *mailbox) {
            warn!("Recovering {}: {}", msg.source, e);
        }
    }
    let assigned = mgr.registry.assign_backups();
    mgr.notify_backup_assignments(nub, &assigned);
    Ok(())
}

fn on_handle_base_app_death(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: HandleBaseAppDeathArgs = msg.args()?;
    info!("{} reports BaseApp {} dead", msg.source, args.addr);
    if !mgr.on_base_app_gone(nub, args.addr, true) {
        mgr.on_backup_gone(nub, args.addr);
    }
    Ok(())
}

fn on_shut_down_stage_ack(mgr: &mut BaseAppMgr, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: ShutDownStageArgs = msg.args()?;
    debug!("{} acknowledged shutdown stage {}", msg.source, args.stage);
    if mgr.shutdown.ack(msg.source, args.stage) {
        mgr.advance_shut_down(nub);
    }
    Ok(())
}
