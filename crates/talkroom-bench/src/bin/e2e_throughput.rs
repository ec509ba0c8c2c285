//! End-to-end throughput benchmark for talkroom.
//!
//! Connects real WebSocket clients to a running server, has every client post
//! messages to one room and counts the message events delivered back.
//!
//! ```bash
//! e2e_throughput [room_id] [credential ...]
//! ```
//!
//! The credentials must be seeded on the server and their users must be
//! members of the room.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8000/ws/talkroom";
const DEFAULT_CREDENTIALS: [&str; 3] = ["alice-dev-token", "bob-dev-token", "carol-dev-token"];
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let room_id: i64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let mut credentials: Vec<String> = args.collect();
    if credentials.is_empty() {
        credentials = DEFAULT_CREDENTIALS.iter().map(ToString::to_string).collect();
    }

    println!("talkroom end-to-end throughput");
    println!("  server:  {SERVER_URL}");
    println!("  room:    {room_id}");
    println!("  clients: {}", credentials.len());
    println!("  warmup {WARMUP_SECS}s, measurement {BENCH_SECS}s");
    println!();

    run_room_benchmark(room_id, credentials).await;
}

async fn run_room_benchmark(room_id: i64, credentials: Vec<String>) {
    let num_clients = credentials.len();
    let received = Arc::new(AtomicU64::new(0));
    let sent = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = credentials
        .into_iter()
        .map(|credential| {
            let received = Arc::clone(&received);
            let sent = Arc::clone(&sent);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                if let Err(e) = run_client(&credential, room_id, received, sent, barrier).await {
                    eprintln!("Client {credential} error: {e}");
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {num_clients} clients connected");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    sent.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let delivered = received.load(Ordering::SeqCst);
    let posted = sent.load(Ordering::SeqCst);

    println!();
    println!("Results");
    println!("  duration:   {elapsed:>10.2}s");
    println!("  posted:     {posted:>10} ({:.0} msg/s)", posted as f64 / elapsed);
    println!(
        "  delivered:  {delivered:>10} ({:.0} msg/s)",
        delivered as f64 / elapsed
    );
    println!(
        "  per client: {:>10.0} msg/s",
        delivered as f64 / elapsed / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    credential: &str,
    room_id: i64,
    received: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(format!("{SERVER_URL}/{credential}")).await?;
    let (mut sender, mut receiver) = ws.split();

    // Wait for all clients to be ready
    barrier.wait().await;

    let frame = serde_json::json!({
        "type": "message",
        "room_id": room_id,
        "content": "x".repeat(64),
    })
    .to_string();

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                if text.starts_with(r#"{"type":"message""#) {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(Message::Text(frame.clone())).await.is_err() {
            break;
        }
        sent.fetch_add(1, Ordering::Relaxed);
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
