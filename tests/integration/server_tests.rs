//! End-to-end tests driving the dispatcher over a real UDP socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;

use stagehand::protocol::{
    ADDR_ERROR, ADDR_PING, ADDR_PONG, ADDR_REPLY, ADDR_SERVER_ADD, ADDR_SERVER_ANNOUNCE,
    ADDR_SERVER_CLIENTS, ADDR_SERVER_LOGS, ADDR_SERVER_NEW, ADDR_SERVER_SESSIONS,
};
use stagehand::server::Server;
use stagehand::session::registry::SessionRegistry;
use stagehand::supervisor::Supervisor;
use stagehand::{Config, TimeoutConfig};

const RECV_BOUND: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    supervisor: Supervisor,
    _home: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

async fn start_server(announce_seconds: u64) -> TestServer {
    let home = tempfile::tempdir().expect("tempdir");
    let config = Config {
        home: home.path().to_path_buf(),
        host: "127.0.0.1".into(),
        port: 0,
        timeouts: TimeoutConfig {
            announce_seconds,
            shutdown_grace_seconds: 1,
        },
    };
    let supervisor = Supervisor::new();
    let sessions = Arc::new(
        SessionRegistry::open(config.home.clone(), supervisor.clone(), config.shutdown_grace())
            .await
            .expect("open registry"),
    );
    let server = Server::bind(config, sessions, supervisor.clone())
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.serve());
    TestServer {
        addr,
        supervisor,
        _home: home,
    }
}

struct TestClient {
    socket: UdpSocket,
}

impl TestClient {
    async fn connect() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.expect("bind client"),
        }
    }

    async fn send(&self, server: SocketAddr, addr: &str, args: Vec<OscType>) {
        let bytes = rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: addr.to_owned(),
            args,
        }))
        .expect("encode");
        self.socket.send_to(&bytes, server).await.expect("send");
    }

    async fn recv(&self) -> OscMessage {
        let mut buf = vec![0u8; 8192];
        let (len, _) = tokio::time::timeout(RECV_BOUND, self.socket.recv_from(&mut buf))
            .await
            .expect("reply within bound")
            .expect("receive");
        match rosc::decoder::decode_udp(&buf[..len]).expect("decode") {
            (_, OscPacket::Message(msg)) => msg,
            (_, OscPacket::Bundle(_)) => panic!("unexpected bundle"),
        }
    }
}

fn string(value: &str) -> OscType {
    OscType::String(value.to_owned())
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = start_server(2).await;
    let client = TestClient::connect().await;

    client.send(server.addr, ADDR_PING, Vec::new()).await;
    let reply = client.recv().await;
    assert_eq!(reply.addr, ADDR_PONG);
    assert!(reply.args.is_empty());
}

#[tokio::test]
async fn new_session_is_created_and_listed() {
    let server = start_server(2).await;
    let client = TestClient::connect().await;

    client
        .send(server.addr, ADDR_SERVER_NEW, vec![string("demo")])
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.addr, ADDR_REPLY);
    assert_eq!(reply.args[0], string(ADDR_SERVER_NEW));

    client.send(server.addr, ADDR_SERVER_SESSIONS, Vec::new()).await;
    let listing = client.recv().await;
    assert_eq!(listing.addr, ADDR_REPLY);
    assert_eq!(
        listing.args,
        vec![
            string(ADDR_SERVER_SESSIONS),
            OscType::Int(1),
            OscType::Int(0),
            string("demo"),
        ]
    );
}

#[tokio::test]
async fn add_without_a_session_is_an_error() {
    let server = start_server(2).await;
    let client = TestClient::connect().await;

    client
        .send(
            server.addr,
            ADDR_SERVER_ADD,
            vec![string("synth"), string("/bin/true")],
        )
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.addr, ADDR_ERROR);
    assert_eq!(reply.args[0], string(ADDR_SERVER_ADD));
    assert_eq!(reply.args[1], OscType::Int(-5), "not-found code");
}

#[tokio::test]
async fn add_without_announce_times_out_and_registers_nothing() {
    let server = start_server(1).await;
    let client = TestClient::connect().await;

    client
        .send(server.addr, ADDR_SERVER_NEW, vec![string("demo")])
        .await;
    client.recv().await;

    client
        .send(
            server.addr,
            ADDR_SERVER_ADD,
            vec![string("synth"), string("/bin/true")],
        )
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.addr, ADDR_ERROR);
    assert_eq!(reply.args[0], string(ADDR_SERVER_ADD));
    assert_eq!(reply.args[1], OscType::Int(-7), "timeout code");

    client.send(server.addr, ADDR_SERVER_CLIENTS, Vec::new()).await;
    let clients = client.recv().await;
    assert_eq!(clients.addr, ADDR_REPLY);
    assert_eq!(
        clients.args,
        vec![string(ADDR_SERVER_CLIENTS), OscType::Int(0)],
        "the silent client must not be registered"
    );
}

#[tokio::test]
async fn announced_client_completes_the_add_handshake() {
    let server = start_server(5).await;
    let controller = TestClient::connect().await;
    let announcer = TestClient::connect().await;

    controller
        .send(server.addr, ADDR_SERVER_NEW, vec![string("demo")])
        .await;
    controller.recv().await;

    controller
        .send(
            server.addr,
            ADDR_SERVER_ADD,
            vec![string("synth"), string("/bin/true")],
        )
        .await;

    // Give the dispatcher time to register the pending handshake before
    // the announce arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    announcer
        .send(
            server.addr,
            ADDR_SERVER_ANNOUNCE,
            vec![
                string("synth-app"),
                string(":dirty:"),
                string("true"),
                OscType::Int(1),
                OscType::Int(2),
                OscType::Int(4242),
            ],
        )
        .await;

    let greeting = announcer.recv().await;
    assert_eq!(greeting.addr, ADDR_REPLY);
    assert_eq!(
        greeting.args,
        vec![
            string(ADDR_SERVER_ANNOUNCE),
            string("stagehand"),
            string(":server-control:"),
        ]
    );

    // The original add requester gets the same greeting, forwarded.
    let forwarded = controller.recv().await;
    assert_eq!(forwarded.addr, ADDR_REPLY);
    assert_eq!(forwarded.args, greeting.args);

    controller
        .send(server.addr, ADDR_SERVER_CLIENTS, Vec::new())
        .await;
    let clients = controller.recv().await;
    assert_eq!(
        clients.args,
        vec![
            string(ADDR_SERVER_CLIENTS),
            OscType::Int(1),
            string("synth-app"),
            string(":dirty:"),
            string("true"),
            OscType::Int(1),
            OscType::Int(2),
            OscType::Int(4242),
        ]
    );
}

#[tokio::test]
async fn client_logs_are_served_over_udp() {
    let server = start_server(5).await;
    let controller = TestClient::connect().await;
    let announcer = TestClient::connect().await;

    controller
        .send(server.addr, ADDR_SERVER_NEW, vec![string("demo")])
        .await;
    controller.recv().await;

    controller
        .send(
            server.addr,
            ADDR_SERVER_ADD,
            vec![string("synth"), string("/bin/echo")],
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    announcer
        .send(
            server.addr,
            ADDR_SERVER_ANNOUNCE,
            vec![
                string("synth-app"),
                string(""),
                string("echo"),
                OscType::Int(1),
                OscType::Int(0),
                OscType::Int(99),
            ],
        )
        .await;
    announcer.recv().await;
    controller.recv().await;

    // Let the spawned /bin/echo finish and its output reach the sink.
    tokio::time::sleep(Duration::from_millis(200)).await;
    controller
        .send(
            server.addr,
            ADDR_SERVER_LOGS,
            vec![string("synth"), OscType::Int(1)],
        )
        .await;
    let logs = controller.recv().await;
    assert_eq!(logs.addr, ADDR_REPLY);
    assert_eq!(logs.args[0], string(ADDR_SERVER_LOGS));
    assert_eq!(logs.args[1], string("synth"));
    let OscType::Int(count) = logs.args[2] else {
        panic!("line count must be an int32");
    };
    assert_eq!(logs.args.len(), 3 + usize::try_from(count).expect("count"));
}

#[tokio::test]
async fn invalid_log_selector_is_an_error() {
    let server = start_server(2).await;
    let client = TestClient::connect().await;

    client
        .send(server.addr, ADDR_SERVER_NEW, vec![string("demo")])
        .await;
    client.recv().await;

    client
        .send(
            server.addr,
            ADDR_SERVER_LOGS,
            vec![string("synth"), OscType::Int(3)],
        )
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.addr, ADDR_ERROR);
    assert_eq!(reply.args[0], string(ADDR_SERVER_LOGS));
    assert_eq!(reply.args[1], OscType::Int(-3), "invalid-argument code");
}
