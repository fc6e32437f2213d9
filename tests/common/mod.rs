#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roomdesk::engine::EngineSettings;
use roomdesk::tenant::TenantManager;
use roomdesk::wire;

pub const PASSWORD: &str = "roomdesk";

pub async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomdesk_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        EngineSettings::default(),
        Duration::from_secs(3600),
    ));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

pub async fn connect(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    connect_db(addr, "test").await
}

/// Connect to one tenant; notifications are forwarded to the returned receiver.
pub async fn connect_db(
    addr: SocketAddr,
    dbname: &str,
) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("frontdesk")
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

pub async fn exec(client: &Client, sql: &str) {
    client
        .batch_execute(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

pub async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failing statement.
pub async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client
        .batch_execute(sql)
        .await
        .expect_err("statement should fail");
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("no SQLSTATE: {err}"))
}

/// Notifications are delivered before the listener's next response, so poke
/// the connection with a cheap query first.
pub async fn poll_notification(
    client: &Client,
    rx: &mut mpsc::UnboundedReceiver<Notification>,
) -> Option<Notification> {
    rows(client, "SELECT * FROM resources").await;
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

pub fn channel(prefix: &str, id: Ulid) -> String {
    format!("{prefix}_{}", id.to_string().to_ascii_lowercase())
}

/// Users, a managed facility and one room.
pub struct Seed {
    pub admin: Ulid,
    pub manager: Ulid,
    pub alice: Ulid,
    pub bob: Ulid,
    pub facility: Ulid,
    pub room: Ulid,
}

pub async fn seed(client: &Client) -> Seed {
    let s = Seed {
        admin: Ulid::new(),
        manager: Ulid::new(),
        alice: Ulid::new(),
        bob: Ulid::new(),
        facility: Ulid::new(),
        room: Ulid::new(),
    };
    for (id, name, role) in [
        (s.admin, "root", "admin"),
        (s.manager, "mia", "facility_manager"),
        (s.alice, "alice", "user"),
        (s.bob, "bob", "user"),
    ] {
        exec(
            client,
            &format!(
                "INSERT INTO users (id, name, email, role) VALUES ('{id}', '{name}', '{name}@example.com', '{role}')"
            ),
        )
        .await;
    }
    exec(
        client,
        &format!(
            "INSERT INTO facilities (id, name, manager_id) VALUES ('{}', 'Headquarters', '{}')",
            s.facility, s.manager
        ),
    )
    .await;
    exec(
        client,
        &format!(
            "INSERT INTO rooms (id, facility_id, name, capacity) VALUES ('{}', '{}', 'Aurora', 8)",
            s.room, s.facility
        ),
    )
    .await;
    s
}

pub fn insert_booking(id: Ulid, room: Ulid, requester: Ulid, start: &str, end: &str) -> String {
    format!(
        r#"INSERT INTO bookings (id, room_id, requester_id, title, start, "end") VALUES ('{id}', '{room}', '{requester}', 'Planning', '{start}', '{end}')"#
    )
}
