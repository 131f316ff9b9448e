//! End-to-end fan-out benchmark for Relay.
//!
//! Connects many WebSocket sessions to a running relay, subscribes each to an
//! instrument and measures how many `data` frames the relay delivers.
//!
//! ```bash
//! RELAY_TOKEN=$(relay issue-token bench) e2e_fanout 64 BTC-USD,ETH-USD
//! ```

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ClientFrame, ServerFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:3000/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let instruments: Vec<String> = args
        .get(2)
        .map(|s| s.split(',').map(str::to_string).collect())
        .unwrap_or_else(|| vec!["BTC-USD".to_string()]);

    let Ok(token) = std::env::var("RELAY_TOKEN") else {
        eprintln!("RELAY_TOKEN must hold a session token (see `relay issue-token`)");
        std::process::exit(2);
    };
    let url = std::env::var("RELAY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          Relay End-to-End Fan-Out Benchmark                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the relay is running: cargo run --release         ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_fanout_benchmark(num_clients, instruments, format!("{url}?token={token}")).await;
}

async fn run_fanout_benchmark(num_clients: usize, instruments: Vec<String>, url: String) {
    println!(
        "📊 Fan-Out Benchmark: {} clients on {:?}",
        num_clients, instruments
    );
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let data_count = Arc::new(AtomicU64::new(0));
    let status_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));
    let instruments = Arc::new(instruments);

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let data_count = Arc::clone(&data_count);
        let status_count = Arc::clone(&status_count);
        let barrier = Arc::clone(&barrier);
        let instruments = Arc::clone(&instruments);
        let url = url.clone();

        let handle = tokio::spawn(async move {
            let client = Client {
                url,
                instruments,
                data_count,
                status_count,
            };
            if let Err(e) = client.run(Arc::clone(&barrier)).await {
                eprintln!("Client {} error: {}", client_id, e);
                // Release the barrier so the run still completes.
                barrier.wait().await;
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    println!("✓ All {} clients subscribed", num_clients);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counters and start measurement
    data_count.store(0, Ordering::SeqCst);
    status_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_data = data_count.load(Ordering::SeqCst);
    let total_status = status_count.load(Ordering::SeqCst);

    let frames_per_sec = total_data as f64 / elapsed.as_secs_f64();
    let frames_per_sec_per_client = frames_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Data Frames:          {:>10}                           ║",
        total_data
    );
    println!(
        "║  Status Notices:       {:>10}                           ║",
        total_status
    );
    println!(
        "║  Throughput:           {:>10.0} frames/s                 ║",
        frames_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} frames/s                 ║",
        frames_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

struct Client {
    url: String,
    instruments: Arc<Vec<String>>,
    data_count: Arc<AtomicU64>,
    status_count: Arc<AtomicU64>,
}

impl Client {
    async fn run(self, barrier: Arc<Barrier>) -> Result<(), BoxError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (mut sender, mut receiver) = ws.split();

        // Connected frame
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: ServerFrame = codec::from_json(&text)?;
                if !matches!(frame, ServerFrame::Connected { .. }) {
                    return Err(format!("expected connected, got {}", frame.name()).into());
                }
            }
            other => return Err(format!("unexpected first message: {:?}", other).into()),
        }

        for instrument in self.instruments.iter() {
            let subscribe = codec::to_json(&ClientFrame::subscribe(instrument.as_str()))?;
            sender.send(Message::Text(subscribe)).await?;
        }

        // Wait for every acknowledgement before joining the barrier.
        let mut pending = self.instruments.len();
        while pending > 0 {
            let Some(message) = receiver.next().await else {
                return Err("connection closed while subscribing".into());
            };
            if let Message::Text(text) = message? {
                match codec::from_json::<ServerFrame>(&text)? {
                    ServerFrame::Subscribed { .. } => pending -= 1,
                    ServerFrame::Error { code, message } => {
                        return Err(format!("subscribe rejected ({code}): {message}").into())
                    }
                    _ => {}
                }
            }
        }

        barrier.wait().await;

        while let Some(message) = receiver.next().await {
            let Message::Text(text) = message? else {
                continue;
            };
            match codec::from_json::<ServerFrame>(&text) {
                Ok(ServerFrame::Data { .. }) => {
                    self.data_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ServerFrame::SystemStatus { message }) => {
                    self.status_count.fetch_add(1, Ordering::Relaxed);
                    eprintln!("status: {message}");
                }
                _ => {}
            }
        }

        Ok(())
    }
}
