//! Two Nubs talking over real loopback sockets.

use mercury::{
    Announcement, Incoming, InterfaceElement, InterfaceTable, ListenerTag, MercuryError, Nub,
    NubConfig, NubHandler,
};
use std::net::Ipv4Addr;
use tokio::time::{timeout, Duration};

const GREET: InterfaceElement = InterfaceElement::new(10, 0, "greet");

#[derive(Default)]
struct Peer {
    greeted: Vec<String>,
    answers: Vec<String>,
    births: Vec<Announcement>,
}

impl NubHandler for Peer {
    fn handle_reply(&mut self, nub: &mut Nub, _tag: u64, reply: Result<Incoming, MercuryError>) {
        if let Ok(message) = reply {
            if let Ok(text) = message.args::<String>() {
                self.answers.push(text);
            }
        }
        nub.break_processing();
    }

    fn handle_birth(&mut self, nub: &mut Nub, _tag: ListenerTag, announcement: &Announcement) {
        self.births.push(announcement.clone());
        nub.break_processing();
    }
}

fn on_greet(peer: &mut Peer, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
    let name: String = msg.args()?;
    peer.greeted.push(name.clone());
    if let Some(reply_id) = msg.reply_id {
        nub.reply(msg.source, reply_id, &format!("hello {name}"))?;
    }
    nub.break_processing();
    Ok(())
}

fn table() -> InterfaceTable<Peer> {
    let mut table = InterfaceTable::new("GreetInterface");
    table.register(GREET, on_greet);
    table
}

fn loopback_config() -> NubConfig {
    NubConfig {
        bind_address: mercury::Address::new(Ipv4Addr::LOCALHOST, 0),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_request_reply_over_loopback() {
    let table = table();
    let mut server = Nub::bind(loopback_config()).unwrap();
    let mut client = Nub::bind(loopback_config()).unwrap();
    let (mut server_peer, mut client_peer) = (Peer::default(), Peer::default());

    client
        .send_request(server.local_addr(), &GREET, &"cell".to_string(), 1)
        .unwrap();

    let result = timeout(Duration::from_secs(5), async {
        let (a, b) = tokio::join!(
            server.run(&mut server_peer, &table),
            client.run(&mut client_peer, &table)
        );
        a.and(b)
    })
    .await;

    assert!(matches!(result, Ok(Ok(()))));
    assert_eq!(server_peer.greeted, vec!["cell".to_string()]);
    assert_eq!(client_peer.answers, vec!["hello cell".to_string()]);
}

#[tokio::test]
async fn test_query_interface_over_loopback() {
    let table = table();
    let mut server = Nub::bind(loopback_config()).unwrap();
    server.advertise("DBMgrInterface");

    let mut client_config = loopback_config();
    client_config.announce_addresses = vec![server.local_addr()];
    let mut client = Nub::bind(client_config).unwrap();
    client.register_birth_listener("DBMgrInterface", 4);
    client.query_interface("DBMgrInterface").unwrap();

    let (mut server_peer, mut client_peer) = (Peer::default(), Peer::default());
    let interrupt = server.interrupt_handle();

    let result = timeout(Duration::from_secs(5), async {
        let client_done = async {
            let outcome = client.run(&mut client_peer, &table).await;
            interrupt.interrupt();
            outcome
        };
        let (a, b) = tokio::join!(server.run(&mut server_peer, &table), client_done);
        a.and(b)
    })
    .await;

    assert!(matches!(result, Ok(Ok(()))));
    assert_eq!(client_peer.births.len(), 1);
    assert_eq!(client_peer.births[0].addr, server.local_addr());
}

#[tokio::test]
async fn test_run_without_socket_fails() {
    let mut nub = Nub::new(mercury::Address::NONE, NubConfig::default());
    let table = table();
    let result = nub.run(&mut Peer::default(), &table).await;
    assert_eq!(result, Err(MercuryError::NotBound));
}
