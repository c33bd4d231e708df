//! # BaseApp Worker
//!
//! A BaseApp that registers with the manager, reports its load, hosts the
//! entities the manager places on it and follows controlled shutdown.
//!
//! The manager is either configured by address or located by querying for
//! its interface name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use baseappmgr::interface::{
    base_app, manager, AddArgs, AddReply, BackupAddReply, BackupTarget, BaseAppDeathArgs,
    CreateBaseArgs, CreateBaseInfo, DelArgs, GlobalBaseArgs, GlobalBaseName, InformOfLoadArgs,
    RestoreEntitiesArgs, SetBackupArgs, SharedDataEntry, SharedDataKey, ShutDownStageArgs,
    BASE_APP_MGR_NAME, BASE_APP_NAME,
};
use baseappmgr::{BaseAppId, EntityMailBox, SharedDataType, ShutDownStage};
use mercury::{
    Address, Announcement, ChannelOwner, FailureReason, Incoming, InterfaceTable, ListenerTag,
    MercuryError, Nub, NubHandler, TimerId,
};
use server_common::{
    AddToManagerHelper, AnonymousChannelClient, JoinConfig, JoinProgress, LookupConfig,
    LookupProgress,
};

const JOIN_TAG: u64 = 1;
const JOIN_TIMER: u64 = 1;
const LOAD_TIMER: u64 = 2;
const MANAGER_LOOKUP_TIMER: u64 = 3;
const MANAGER_LISTENER: ListenerTag = 1;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address handed to clients; the Nub address when `None`
    pub external_addr: Option<Address>,
    /// Manager address; located by interface query when `None`
    pub manager: Option<Address>,
    /// Register as a backup BaseApp
    pub backup: bool,
    pub join: JoinConfig,
    pub lookup: LookupConfig,
    pub load_report_interval: Duration,
    /// Entities at which the reported load reaches 1.0
    pub capacity: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            external_addr: None,
            manager: None,
            backup: false,
            join: JoinConfig::default(),
            lookup: LookupConfig::default(),
            load_report_interval: Duration::from_secs(1),
            capacity: 1000,
        }
    }
}

#[derive(Debug)]
pub struct BaseAppWorker {
    config: WorkerConfig,
    manager_lookup: AnonymousChannelClient,
    join: Option<AddToManagerHelper<AddArgs>>,
    manager: Option<ChannelOwner>,
    id: Option<BaseAppId>,
    entities: BTreeMap<u32, u16>,
    next_entity_id: u32,
    create_base_addr: Option<Address>,
    backup: Option<Address>,
    backing_up: BTreeSet<Address>,
    shared_data: HashMap<(SharedDataType, String), String>,
    global_bases: HashMap<String, EntityMailBox>,
    restored: Vec<Address>,
    load_timer: Option<TimerId>,
    retiring: bool,
}

impl BaseAppWorker {
    pub fn new(config: WorkerConfig) -> Self {
        let manager_lookup = AnonymousChannelClient::new(
            BASE_APP_MGR_NAME,
            MANAGER_LISTENER,
            MANAGER_LOOKUP_TIMER,
            config.lookup.clone(),
        );
        Self {
            config,
            manager_lookup,
            join: None,
            manager: None,
            id: None,
            entities: BTreeMap::new(),
            next_entity_id: 1,
            create_base_addr: None,
            backup: None,
            backing_up: BTreeSet::new(),
            shared_data: HashMap::new(),
            global_bases: HashMap::new(),
            restored: Vec::new(),
            load_timer: None,
            retiring: false,
        }
    }

    pub fn interface_table() -> InterfaceTable<BaseAppWorker> {
        let mut table = InterfaceTable::new(BASE_APP_NAME);
        table
            .register(base_app::SHUT_DOWN, on_shut_down)
            .register(base_app::SHUT_DOWN_STAGE, on_shut_down_stage)
            .register(base_app::HANDLE_BASE_APP_DEATH, on_handle_base_app_death)
            .register(base_app::SET_SHARED_DATA, on_set_shared_data)
            .register(base_app::DEL_SHARED_DATA, on_del_shared_data)
            .register(base_app::SET_BACKUP, on_set_backup)
            .register(base_app::UPDATE_CREATE_BASE_INFO, on_update_create_base_info)
            .register(base_app::ADD_GLOBAL_BASE, on_add_global_base)
            .register(base_app::DEL_GLOBAL_BASE, on_del_global_base)
            .register(base_app::CREATE_BASE, on_create_base)
            .register(base_app::RESTORE_ENTITIES, on_restore_entities)
            .register(base_app::START_BACKUP, on_start_backup)
            .register(base_app::STOP_BACKUP, on_stop_backup);
        table
    }

    /// Begins registration, locating the manager first if needed.
    pub fn start(&mut self, nub: &mut Nub) -> Result<(), MercuryError> {
        match self.config.manager {
            Some(manager) => self.begin_join(nub, manager),
            None => {
                info!("🔍 Looking for {}", BASE_APP_MGR_NAME);
                self.manager_lookup.init(nub)
            }
        }
    }

    pub fn id(&self) -> Option<BaseAppId> {
        self.id
    }

    pub fn manager_addr(&self) -> Option<Address> {
        self.manager.as_ref().map(|m| m.addr())
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn create_base_addr(&self) -> Option<Address> {
        self.create_base_addr
    }

    pub fn backup(&self) -> Option<Address> {
        self.backup
    }

    pub fn backing_up(&self) -> &BTreeSet<Address> {
        &self.backing_up
    }

    pub fn restored(&self) -> &[Address] {
        &self.restored
    }

    /// Load in `[0, 1]` derived from the number of hosted entities.
    pub fn load(&self) -> f32 {
        (self.entities.len() as f32 / self.config.capacity.max(1) as f32).min(1.0)
    }

    fn begin_join(&mut self, nub: &mut Nub, manager_addr: Address) -> Result<(), MercuryError> {
        let element = if self.config.backup {
            manager::ADD_BACKUP
        } else {
            manager::ADD
        };
        let args = AddArgs {
            external_addr: self.config.external_addr.unwrap_or_else(|| nub.local_addr()),
        };
        let mut helper = AddToManagerHelper::new(
            manager_addr,
            element,
            args,
            JOIN_TAG,
            JOIN_TIMER,
            self.config.join.clone(),
        );
        helper.start(nub)?;
        self.join = Some(helper);
        Ok(())
    }

    fn on_joined(&mut self, nub: &mut Nub, reply: Incoming) -> Result<(), MercuryError> {
        let manager = ChannelOwner::new(nub, reply.source);
        if self.config.backup {
            let reply: BackupAddReply = reply.args()?;
            info!("✅ Registered as backup BaseApp {} with {}", reply.id, manager.addr());
            self.id = Some(reply.id);
        } else {
            let reply: AddReply = reply.args()?;
            info!(
                "✅ Registered as BaseApp {} with {} at game time {}",
                reply.id,
                manager.addr(),
                reply.game_time
            );
            self.id = Some(reply.id);
            self.create_base_addr = Some(reply.create_base_addr);
            for (key, value) in reply.shared_base_app_data {
                self.shared_data.insert((SharedDataType::BaseApp, key), value);
            }
            for (key, value) in reply.shared_global_data {
                self.shared_data.insert((SharedDataType::Global, key), value);
            }
            self.load_timer = Some(nub.register_timer(self.config.load_report_interval, LOAD_TIMER));
        }
        self.manager = Some(manager);
        nub.announce_birth(BASE_APP_NAME)
    }

    fn report_load(&self, nub: &mut Nub) {
        let Some(manager) = self.manager.as_ref() else {
            return;
        };
        let args = InformOfLoadArgs {
            load: self.load(),
            num_bases: self.entities.len() as u32,
            num_proxies: 0,
        };
        if let Err(e) = manager.send(nub, &manager::INFORM_OF_LOAD, &args) {
            warn!("Could not report load: {}", e);
        }
    }

    /// Deregisters from the manager and stops.
    pub fn leave(&mut self, nub: &mut Nub) {
        if let (Some(manager), Some(id)) = (self.manager.as_ref(), self.id) {
            info!("👋 BaseApp {} leaving", id);
            if let Err(e) = manager.send(nub, &manager::DEL, &DelArgs { id }) {
                warn!("Could not deregister: {}", e);
            }
        }
        if let Some(timer) = self.load_timer.take() {
            nub.cancel_timer(timer);
        }
        nub.break_processing();
    }
}

impl NubHandler for BaseAppWorker {
    fn handle_timeout(&mut self, nub: &mut Nub, id: TimerId, arg: u64) -> Option<Duration> {
        match arg {
            JOIN_TIMER => {
                if let Some(join) = self.join.as_mut() {
                    join.handle_timeout(nub, id);
                }
                None
            }
            LOAD_TIMER if self.load_timer == Some(id) => {
                self.report_load(nub);
                Some(self.config.load_report_interval)
            }
            MANAGER_LOOKUP_TIMER => {
                if self.manager_lookup.handle_timeout(nub, id) == LookupProgress::Failed {
                    error!("❌ No {} answered, giving up", BASE_APP_MGR_NAME);
                    nub.break_processing();
                }
                None
            }
            _ => None,
        }
    }

    fn handle_reply(&mut self, nub: &mut Nub, tag: u64, reply: Result<Incoming, MercuryError>) {
        let Some(join) = self.join.as_mut() else {
            debug!("Reply with tag {} before registration", tag);
            return;
        };
        match join.handle_reply(nub, tag, reply) {
            JoinProgress::Joined(reply) => {
                if let Err(e) = self.on_joined(nub, reply) {
                    error!("❌ Bad registration reply: {}", e);
                    nub.break_processing();
                }
            }
            JoinProgress::Aborted(e) => error!("❌ Registration failed: {}", e),
            JoinProgress::Pending | JoinProgress::Ignored => {}
        }
    }

    fn handle_birth(&mut self, nub: &mut Nub, tag: ListenerTag, announcement: &Announcement) {
        if self.join.is_some() {
            return;
        }
        if let LookupProgress::Bound(addr) = self.manager_lookup.handle_birth(nub, tag, announcement) {
            if let Err(e) = self.begin_join(nub, addr) {
                error!("❌ Could not register with {}: {}", addr, e);
                nub.break_processing();
            }
        }
    }

    fn handle_channel_failure(&mut self, nub: &mut Nub, addr: Address, reason: FailureReason) {
        if self.manager_addr() == Some(addr) {
            error!("💀 Lost the manager at {}: {}", addr, reason);
            nub.break_processing();
        } else {
            warn!("Channel to {} failed: {}", addr, reason);
        }
    }

    fn handle_interrupt(&mut self, nub: &mut Nub) {
        self.leave(nub);
    }
}

fn on_shut_down(_worker: &mut BaseAppWorker, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    info!("🛑 Shut down by {}", msg.source);
    nub.break_processing();
    Ok(())
}

fn on_shut_down_stage(worker: &mut BaseAppWorker, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: ShutDownStageArgs = msg.args()?;
    info!("⏳ Shutdown stage {}", args.stage);
    worker.retiring = true;
    if let Some(timer) = worker.load_timer.take() {
        nub.cancel_timer(timer);
    }
    match worker.manager.as_ref() {
        Some(manager) => manager.send(nub, &manager::SHUT_DOWN_STAGE_ACK, &args)?,
        None => nub.send(msg.source, &manager::SHUT_DOWN_STAGE_ACK, &args)?,
    }
    if args.stage == ShutDownStage::Perform {
        info!("🏁 Entities written, stopping");
        nub.break_processing();
    }
    Ok(())
}

fn on_handle_base_app_death(_worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: BaseAppDeathArgs = msg.args()?;
    match args.restored_at {
        Some(at) => info!("BaseApp {} died, entities restored on {}", args.dead, at),
        None => info!("BaseApp {} left", args.dead),
    }
    Ok(())
}

fn on_set_shared_data(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let entry: SharedDataEntry = msg.args()?;
    worker.shared_data.insert((entry.kind, entry.key), entry.value);
    Ok(())
}

fn on_del_shared_data(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let key: SharedDataKey = msg.args()?;
    worker.shared_data.remove(&(key.kind, key.key));
    Ok(())
}

fn on_set_backup(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: SetBackupArgs = msg.args()?;
    debug!("Backup is now {:?}", args.backup);
    worker.backup = args.backup;
    Ok(())
}

fn on_update_create_base_info(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: CreateBaseInfo = msg.args()?;
    worker.create_base_addr = Some(args.best);
    Ok(())
}

fn on_add_global_base(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: GlobalBaseArgs = msg.args()?;
    worker.global_bases.insert(args.name, args.mailbox);
    Ok(())
}

fn on_del_global_base(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: GlobalBaseName = msg.args()?;
    worker.global_bases.remove(&args.name);
    Ok(())
}

fn on_create_base(worker: &mut BaseAppWorker, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let reply_id = msg
        .reply_id
        .ok_or_else(|| MercuryError::Protocol("createBase without reply id".into()))?;
    let args: CreateBaseArgs = msg.args()?;
    if worker.retiring {
        warn!("Creating entity type {} while retiring", args.entity_type);
    }
    let id = worker.next_entity_id;
    worker.next_entity_id += 1;
    worker.entities.insert(id, args.entity_type);
    debug!("Created entity {} of type {}", id, args.entity_type);

    let mailbox = EntityMailBox {
        id,
        addr: nub.local_addr(),
        entity_type: args.entity_type,
    };
    nub.reply(msg.source, reply_id, &mailbox)
}

fn on_restore_entities(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: RestoreEntitiesArgs = msg.args()?;
    info!("🚑 Restoring entities of {}", args.dead);
    worker.backing_up.remove(&args.dead);
    worker.restored.push(args.dead);
    Ok(())
}

fn on_start_backup(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: BackupTarget = msg.args()?;
    info!("Backing up {}", args.base_app);
    worker.backing_up.insert(args.base_app);
    Ok(())
}

fn on_stop_backup(worker: &mut BaseAppWorker, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let args: BackupTarget = msg.args()?;
    worker.backing_up.remove(&args.base_app);
    Ok(())
}
