use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
// 2030-01-07 00:00, a Monday
const BASE: i64 = 1_893_974_400_000;
// One-hour bookings every two hours keep clear of the 30 minute buffer.
const STRIDE: i64 = 2 * HOUR;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("roomdesk")
        .password("roomdesk");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A requester and one room in a facility, created in the connected tenant.
struct Desk {
    requester: Ulid,
    facility: Ulid,
    room: Ulid,
}

async fn setup_desk(client: &tokio_postgres::Client) -> Desk {
    let desk = Desk {
        requester: Ulid::new(),
        facility: Ulid::new(),
        room: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{}', 'bench', 'bench-{}@example.com')",
            desk.requester, desk.requester
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO facilities (id, name) VALUES ('{}', 'Bench HQ')",
            desk.facility
        ))
        .await
        .unwrap();
    add_room(client, &desk, desk.room, 10).await;
    desk
}

async fn add_room(client: &tokio_postgres::Client, desk: &Desk, room: Ulid, capacity: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, facility_id, name, capacity) VALUES ('{room}', '{}', 'Room {room}', {capacity})",
            desk.facility
        ))
        .await
        .unwrap();
}

fn booking_sql(room: Ulid, requester: Ulid, start: i64, end: i64) -> String {
    let bid = Ulid::new();
    format!(
        r#"INSERT INTO bookings (id, room_id, requester_id, title, start, "end") VALUES ('{bid}', '{room}', '{requester}', 'bench', {start}, {end})"#
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let desk = setup_desk(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = BASE + (i as i64) * STRIDE;
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(desk.room, desk.requester, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let desk = setup_desk(&client).await;
            for j in 0..n_per_task {
                let s = BASE + (j as i64) * STRIDE;
                client
                    .batch_execute(&booking_sql(desk.room, desk.requester, s, s + HOUR))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup_client = connect(host, port, &tenant).await;
    let desk = setup_desk(&setup_client).await;
    let mut rooms = vec![desk.room];
    for _ in 0..19 {
        let room = Ulid::new();
        add_room(&setup_client, &desk, room, 4).await;
        rooms.push(room);
    }
    // Every room busy for the first week
    for &room in &rooms {
        for i in 0..84 {
            let s = BASE + i * STRIDE;
            setup_client
                .batch_execute(&booking_sql(room, desk.requester, s, s + HOUR))
                .await
                .unwrap();
        }
    }
    drop(setup_client);

    // Writers book later weeks in the same tenant.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for (w, &room) in rooms.iter().take(5).enumerate() {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        let requester = desk.requester;
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = BASE + (w as i64 + 1) * 7 * 24 * HOUR + i * STRIDE;
                let _ = client
                    .batch_execute(&booking_sql(room, requester, s, s + HOUR))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        let room = rooms[r % rooms.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut grid = Vec::with_capacity(reads_per_reader);
            let mut search = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM slots WHERE room_id = '{room}' AND day = '2030-01-0{}'",
                        7 + i % 3
                    ))
                    .await
                    .unwrap();
                grid.push(t.elapsed());

                let s = BASE + (i as i64 % 84) * STRIDE + HOUR;
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM available_rooms WHERE start >= {s} AND "end" <= {}"#,
                        s + HOUR
                    ))
                    .await
                    .unwrap();
                search.push(t.elapsed());
            }
            (grid, search)
        }));
    }

    let mut grid_latencies = Vec::new();
    let mut search_latencies = Vec::new();
    for h in reader_handles {
        let (grid, search) = h.await.unwrap();
        grid_latencies.extend(grid);
        search_latencies.extend(search);
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slot grid", &mut grid_latencies);
    print_latency("available rooms", &mut search_latencies);
}

/// Many clients race for the same slots; exactly one request per slot may win.
async fn phase4_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup_client = connect(host, port, &tenant).await;
    let desk = Arc::new(setup_desk(&setup_client).await);
    drop(setup_client);

    let n_clients = 20;
    let n_slots = 50;
    let accepted = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let host = host.to_string();
        let tenant = tenant.clone();
        let desk = desk.clone();
        let accepted = accepted.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            for i in 0..n_slots {
                let s = BASE + (i as i64) * STRIDE;
                match client
                    .batch_execute(&booking_sql(desk.room, desk.requester, s, s + HOUR))
                    .await
                {
                    Ok(()) => {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code().is_some_and(|c| c.code() == "23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => eprintln!("unexpected error: {e}"),
                }
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = accepted.load(Ordering::Relaxed);
    let lost = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_slots} slots: {ok} accepted, {lost} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    if ok != n_slots {
        println!("  WARNING: expected exactly {n_slots} accepted bookings");
    }
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let desk = setup_desk(&client).await;
            for i in 0..ops_per_conn {
                let s = BASE + (i as i64) * STRIDE;
                client
                    .batch_execute(&booking_sql(desk.room, desk.requester, s, s + HOUR))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOMDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ROOMDESK_PORT");

    println!("=== roomdesk stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] slot contention");
    phase4_contention(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
