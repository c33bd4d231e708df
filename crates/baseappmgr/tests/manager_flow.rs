//! A manager and fake BaseApps exchanging datagrams in memory.

use baseappmgr::interface::{
    base_app, manager, AddArgs, AddReply, BaseAppDeathArgs, CreateBaseArgs, CreateBaseResult,
    EntityMailBox, InformOfLoadArgs, ShutDownStageArgs,
};
use baseappmgr::{BaseAppMgr, BaseAppMgrConfig, HealthSummary, ShutDownStage};
use mercury::{
    decode_payload, Address, FailureReason, Incoming, InterfaceTable, MercuryError, Nub, NubConfig,
    NubHandler,
};
use tokio::time::{Duration, Instant};

const REQUEST_TAG: u64 = 7;

/// Records everything the manager sends and answers the requests a BaseApp
/// would answer.
#[derive(Default)]
struct FakeBaseApp {
    received: Vec<(u8, Vec<u8>)>,
    replies: Vec<Result<Incoming, MercuryError>>,
    ack_stages: bool,
}

impl FakeBaseApp {
    fn received(&self, method: u8) -> Vec<&[u8]> {
        self.received
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, payload)| payload.as_slice())
            .collect()
    }

    fn methods(&self) -> Vec<u8> {
        self.received.iter().map(|(m, _)| *m).collect()
    }
}

impl NubHandler for FakeBaseApp {
    fn handle_reply(&mut self, _nub: &mut Nub, tag: u64, reply: Result<Incoming, MercuryError>) {
        assert_eq!(tag, REQUEST_TAG);
        self.replies.push(reply);
    }
}

fn record(app: &mut FakeBaseApp, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    app.received.push((msg.method, msg.payload.clone()));
    Ok(())
}

fn on_create_base(app: &mut FakeBaseApp, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    record(app, nub, msg)?;
    let args: CreateBaseArgs = msg.args()?;
    let reply_id = msg.reply_id.ok_or_else(|| MercuryError::Protocol("no reply id".into()))?;
    let mailbox = EntityMailBox {
        id: 100,
        addr: nub.local_addr(),
        entity_type: args.entity_type,
    };
    nub.reply(msg.source, reply_id, &mailbox)
}

fn on_shut_down_stage(app: &mut FakeBaseApp, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    record(app, nub, msg)?;
    let args: ShutDownStageArgs = msg.args()?;
    if app.ack_stages {
        nub.send(msg.source, &manager::SHUT_DOWN_STAGE_ACK, &args)?;
    }
    Ok(())
}

fn base_app_table() -> InterfaceTable<FakeBaseApp> {
    let mut table = InterfaceTable::new("BaseAppInterface");
    table
        .register(base_app::SHUT_DOWN, record)
        .register(base_app::SHUT_DOWN_STAGE, on_shut_down_stage)
        .register(base_app::HANDLE_BASE_APP_DEATH, record)
        .register(base_app::SET_SHARED_DATA, record)
        .register(base_app::DEL_SHARED_DATA, record)
        .register(base_app::SET_BACKUP, record)
        .register(base_app::UPDATE_CREATE_BASE_INFO, record)
        .register(base_app::ADD_GLOBAL_BASE, record)
        .register(base_app::DEL_GLOBAL_BASE, record)
        .register(base_app::CREATE_BASE, on_create_base)
        .register(base_app::RESTORE_ENTITIES, record)
        .register(base_app::START_BACKUP, record)
        .register(base_app::STOP_BACKUP, record);
    table
}

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

struct Cluster {
    now: Instant,
    mgr_nub: Nub,
    mgr: BaseAppMgr,
    apps: Vec<(Nub, FakeBaseApp)>,
}

impl Cluster {
    fn new(config: BaseAppMgrConfig) -> Self {
        let mut mgr_nub = Nub::new(addr("10.0.0.100:20000"), NubConfig::default());
        let mut mgr = BaseAppMgr::new(config);
        mgr.init(&mut mgr_nub).unwrap();
        Self {
            now: Instant::now(),
            mgr_nub,
            mgr,
            apps: Vec::new(),
        }
    }

    fn manager_addr(&self) -> Address {
        self.mgr_nub.local_addr()
    }

    /// Adds a fake process and returns its index.
    fn spawn(&mut self, at: &str) -> usize {
        let app = FakeBaseApp {
            ack_stages: true,
            ..Default::default()
        };
        self.apps.push((Nub::new(addr(at), NubConfig::default()), app));
        self.apps.len() - 1
    }

    fn app(&mut self, index: usize) -> (&mut Nub, &mut FakeBaseApp) {
        let (nub, app) = &mut self.apps[index];
        (nub, app)
    }

    fn pump(&mut self, rounds: u32) {
        let mgr_table = BaseAppMgr::interface_table();
        let app_table = base_app_table();
        let step = Duration::from_millis(20);

        for _ in 0..rounds {
            let mut in_flight = Vec::new();
            let mgr_addr = self.mgr_nub.local_addr();
            in_flight.extend(self.mgr_nub.drain_outbox().into_iter().map(|(to, b)| (mgr_addr, to, b)));
            for (nub, _) in self.apps.iter_mut() {
                let from = nub.local_addr();
                in_flight.extend(nub.drain_outbox().into_iter().map(|(to, b)| (from, to, b)));
            }

            for (from, to, bytes) in in_flight {
                if to == mgr_addr {
                    self.mgr_nub
                        .process_datagram(&mut self.mgr, &mgr_table, from, &bytes, self.now);
                } else if let Some((nub, app)) = self.apps.iter_mut().find(|(n, _)| n.local_addr() == to) {
                    nub.process_datagram(app, &app_table, from, &bytes, self.now);
                }
            }

            self.now += step;
            self.mgr_nub.process_timers(&mut self.mgr, self.now);
            for (nub, app) in self.apps.iter_mut() {
                nub.process_timers(app, self.now);
            }
        }
    }

    /// Registers app `index` and returns the manager's reply.
    fn register(&mut self, index: usize) -> AddReply {
        let mgr_addr = self.manager_addr();
        let (nub, _) = self.app(index);
        let external_addr = nub.local_addr();
        nub.send_request(mgr_addr, &manager::ADD, &AddArgs { external_addr }, REQUEST_TAG)
            .unwrap();
        self.pump(5);
        let (_, app) = self.app(index);
        let reply = app.replies.pop().expect("no reply to add").unwrap();
        reply.args().unwrap()
    }

    fn register_backup(&mut self, index: usize) {
        let mgr_addr = self.manager_addr();
        let (nub, _) = self.app(index);
        nub.send_request(mgr_addr, &manager::ADD_BACKUP, &(), REQUEST_TAG)
            .unwrap();
        self.pump(5);
        let (_, app) = self.app(index);
        assert!(!app.replies.pop().expect("no reply to addBackup").unwrap().is_empty());
    }

    fn inform_of_load(&mut self, index: usize, load: f32, num_bases: u32) {
        let mgr_addr = self.manager_addr();
        let (nub, _) = self.app(index);
        let args = InformOfLoadArgs {
            load,
            num_bases,
            num_proxies: 0,
        };
        nub.send(mgr_addr, &manager::INFORM_OF_LOAD, &args).unwrap();
        self.pump(3);
    }
}

fn test_config() -> BaseAppMgrConfig {
    BaseAppMgrConfig {
        db_mgr_lookup: None,
        ..Default::default()
    }
}

#[test]
fn test_registration_and_entity_placement() {
    let mut cluster = Cluster::new(test_config());
    let busy = cluster.spawn("10.0.0.1:30000");
    let idle = cluster.spawn("10.0.0.2:30000");
    let client = cluster.spawn("10.0.0.50:40000");

    assert_eq!(cluster.register(busy).id, 1);
    assert_eq!(cluster.register(idle).id, 2);
    // Registering twice keeps the id
    assert_eq!(cluster.register(idle).id, 2);

    cluster.inform_of_load(busy, 0.7, 40);
    cluster.inform_of_load(idle, 0.2, 5);
    assert_eq!(cluster.mgr.registry().num_bases(), 45);

    let mgr_addr = cluster.manager_addr();
    let (nub, _) = cluster.app(client);
    let args = CreateBaseArgs {
        entity_type: 3,
        properties: vec![1, 2, 3],
    };
    nub.send_request(mgr_addr, &manager::CREATE_BASE_ENTITY, &args, REQUEST_TAG)
        .unwrap();
    cluster.pump(10);

    let idle_addr = addr("10.0.0.2:30000");
    let (_, idle_app) = cluster.app(idle);
    assert_eq!(idle_app.received(base_app::CREATE_BASE.method).len(), 1);

    let (_, client_app) = cluster.app(client);
    let reply = client_app.replies.pop().unwrap().unwrap();
    match reply.args::<CreateBaseResult>().unwrap() {
        CreateBaseResult::Created(mailbox) => {
            assert_eq!(mailbox.addr, idle_addr);
            assert_eq!(mailbox.entity_type, 3);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_add_refused_when_not_accepting() {
    let mut cluster = Cluster::new(test_config());
    cluster.mgr.set_allow_new_base_apps(false);
    let app = cluster.spawn("10.0.0.1:30000");

    let mgr_addr = cluster.manager_addr();
    let (nub, _) = cluster.app(app);
    nub.send_request(
        mgr_addr,
        &manager::ADD,
        &AddArgs {
            external_addr: addr("1.2.3.4:5"),
        },
        REQUEST_TAG,
    )
    .unwrap();
    cluster.pump(5);

    let (_, fake) = cluster.app(app);
    assert!(fake.replies.pop().unwrap().unwrap().is_empty());
    assert_eq!(cluster.mgr.registry().num_base_apps(), 0);
}

#[test]
fn test_base_app_death_restores_on_backup() {
    let mut cluster = Cluster::new(test_config());
    let backup = cluster.spawn("10.0.1.1:30000");
    let doomed = cluster.spawn("10.0.0.1:30000");
    let survivor = cluster.spawn("10.0.0.2:30000");
    cluster.register_backup(backup);
    cluster.register(doomed);
    cluster.register(survivor);

    let doomed_addr = addr("10.0.0.1:30000");
    let backup_addr = addr("10.0.1.1:30000");
    cluster.mgr_nub.fail_channel(doomed_addr, FailureReason::NoAck);
    cluster.pump(5);

    assert!(!cluster.mgr.registry().contains(doomed_addr));

    let (_, backup_app) = cluster.app(backup);
    assert_eq!(backup_app.received(base_app::START_BACKUP.method).len(), 2);
    assert_eq!(backup_app.received(base_app::RESTORE_ENTITIES.method).len(), 1);

    let (_, survivor_app) = cluster.app(survivor);
    let deaths: Vec<BaseAppDeathArgs> = survivor_app
        .received(base_app::HANDLE_BASE_APP_DEATH.method)
        .into_iter()
        .map(|payload| decode_payload(payload).unwrap())
        .collect();
    assert_eq!(
        deaths,
        vec![BaseAppDeathArgs {
            dead: doomed_addr,
            restored_at: Some(backup_addr),
        }]
    );
}

#[test]
fn test_controlled_shutdown_walks_every_stage() {
    let mut cluster = Cluster::new(test_config());
    let first = cluster.spawn("10.0.0.1:30000");
    let second = cluster.spawn("10.0.0.2:30000");
    cluster.register(first);
    cluster.register(second);

    cluster.mgr.start_controlled_shut_down(&mut cluster.mgr_nub);
    cluster.pump(20);

    assert_eq!(cluster.mgr.shut_down_stage(), ShutDownStage::Finished);
    assert!(cluster.mgr_nub.processing_broken());

    for index in [first, second] {
        let (_, app) = cluster.app(index);
        let stages: Vec<ShutDownStage> = app
            .received(base_app::SHUT_DOWN_STAGE.method)
            .into_iter()
            .map(|payload| decode_payload::<ShutDownStageArgs>(payload).unwrap().stage)
            .collect();
        assert_eq!(
            stages,
            vec![
                ShutDownStage::Request,
                ShutDownStage::DisconnectProxies,
                ShutDownStage::Perform
            ]
        );
        assert!(!app.methods().contains(&base_app::SHUT_DOWN.method));
    }
}

#[test]
fn test_check_status_reports_health() {
    let mut cluster = Cluster::new(test_config());
    let app = cluster.spawn("10.0.0.1:30000");
    let client = cluster.spawn("10.0.0.50:40000");
    cluster.register(app);
    cluster.inform_of_load(app, 0.4, 12);

    let mgr_addr = cluster.manager_addr();
    let (nub, _) = cluster.app(client);
    nub.send_request(mgr_addr, &manager::CHECK_STATUS, &(), REQUEST_TAG)
        .unwrap();
    cluster.pump(5);

    let (_, fake) = cluster.app(client);
    let summary: HealthSummary = fake.replies.pop().unwrap().unwrap().args().unwrap();
    assert_eq!(summary.num_base_apps, 1);
    assert_eq!(summary.num_bases, 12);
    assert!(summary.accepting_new_base_apps);
    assert_eq!(summary.shut_down_stage, ShutDownStage::None);
    assert!((summary.max_load - 0.4).abs() < f32::EPSILON);
}
