use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const DATE: &str = "2025-06-02";

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("baykeeper")
        .user("baykeeper")
        .password("baykeeper");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

async fn create_garage(client: &Client, bays: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO garages (id, name, bays, open_time, close_time) VALUES ('{id}', 'bench', {bays}, '06:00', '22:00')"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, garage: Ulid, start: &str, end: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time, services) \
             VALUES ('{id}', '{}', '{garage}', '{}', '{DATE}', '{start}', '{end}', 'oil_change')",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap();
    id
}

fn slot(i: usize) -> (String, String) {
    // Quarter-hour slots between 06:00 and 22:00.
    let start = 6 * 60 + (i % 63) * 15;
    let end = start + 15;
    (
        format!("{:02}:{:02}", start / 60, start % 60),
        format!("{:02}:{:02}", end / 60, end % 60),
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let garage = create_garage(&client, 200).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let (s, e) = slot(i);
        let id = book(&client, garage, &s, &e).await;
        let t = Instant::now();
        client
            .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{id}'"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} book+confirm cycles in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("confirm latency", &mut latencies);
}

/// Many clients race to confirm overlapping requests for a small garage.
/// Exactly `bays` confirmations may win.
async fn phase2_race(host: &str, port: u16, bays: u32, contenders: usize) {
    let setup = connect(host, port).await;
    let garage = create_garage(&setup, bays).await;
    let mut ids = Vec::with_capacity(contenders);
    for _ in 0..contenders {
        ids.push(book(&setup, garage, "10:00", "11:00").await);
    }

    let wins = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for id in ids {
        let host = host.to_string();
        let wins = wins.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            if client
                .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{id}'"))
                .await
                .is_ok()
            {
                wins.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let won = wins.load(Ordering::Relaxed);
    let verdict = if won == bays as usize { "ok" } else { "OVERBOOKED" };
    println!(
        "  {contenders} contenders for {bays} bays: {won} confirmed in {:.2}s [{verdict}]",
        start.elapsed().as_secs_f64()
    );
}

async fn phase3_availability_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let garage = create_garage(&setup, 20).await;
    for i in 0..200 {
        let (s, e) = slot(i);
        let id = book(&setup, garage, &s, &e).await;
        let _ = setup
            .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{id}'"))
            .await;
    }
    drop(setup);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = w * 1000;
            while !stop.load(Ordering::Relaxed) {
                let (s, e) = slot(i);
                let id = book(&client, garage, &s, &e).await;
                let _ = client
                    .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{id}'"))
                    .await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for r in 0..10 {
        let host = host.to_string();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(500);
            for i in 0..500 {
                let (s, e) = slot(r * 500 + i);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM available_bays WHERE garage_id = '{garage}' AND date = '{DATE}' \
                         AND start_time = '{s}' AND end_time = '{e}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("BAYKEEPER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("BAYKEEPER_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid BAYKEEPER_PORT");

    println!("=== baykeeper confirmation benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential book + confirm");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] confirmation races");
    phase2_race(&host, port, 1, 50).await;
    phase2_race(&host, port, 5, 100).await;

    println!("\n[phase 3] availability latency under confirm load");
    phase3_availability_under_load(&host, port).await;

    println!("\n=== done ===");
}
